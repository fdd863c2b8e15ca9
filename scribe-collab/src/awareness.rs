//! Awareness roster for a collaborative room.
//!
//! Each connection publishes `{name, color}` on the room's ephemeral bus.
//! The visible roster is the distinct-by-name projection of that
//! per-connection table:
//!
//! ```text
//! transport table (by connection)        roster (by name)
//! ┌────┬──────────────┐                  ┌──────────────┐
//! │ 3  │ Alice #c8…   │ ───┐             │ Alice #c8…   │
//! │ 5  │ Bob   #4a…   │ ───┼── dedup ──► │ Bob   #4a…   │
//! │ 9  │ Alice #c8…   │ ───┘             └──────────────┘
//! └────┴──────────────┘
//! ```
//!
//! The roster is recomputed on every bus change event. The registry owns
//! no polling timer; its only timer is the one-shot settle republish.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::protocol::{AwarenessState, ConnectionId};
use crate::transport::{RoomEvent, RoomTransport};

/// 24-bit display color for a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl DisplayColor {
    /// Channel floor keeping colors legible on a light background.
    pub const MIN_CHANNEL: u8 = 50;

    /// Deterministic color for a display name.
    ///
    /// 32-bit string hash over UTF-16 code units
    /// (`hash = unit + (hash << 5) - hash`, wrapping), whose three low bytes
    /// become red, green and blue, each raised to at least
    /// [`Self::MIN_CHANNEL`].
    pub fn from_name(name: &str) -> Self {
        let hash = name.encode_utf16().fold(0i32, |hash, unit| {
            (unit as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash))
        });
        let channel = |i: u32| (((hash >> (i * 8)) & 0xFF) as u8).max(Self::MIN_CHANNEL);
        Self {
            r: channel(0),
            g: channel(1),
            b: channel(2),
        }
    }

    /// CSS-style `#rrggbb` string.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Distinct-by-name projection of a per-connection awareness table.
///
/// Connections are visited in ascending id order, so the lowest connection
/// id decides a shared name's entry. Nameless entries are skipped.
pub fn project_roster(states: &BTreeMap<ConnectionId, AwarenessState>) -> Vec<AwarenessState> {
    let mut seen = HashSet::new();
    states
        .values()
        .filter(|state| !state.name.trim().is_empty())
        .filter(|state| seen.insert(state.name.as_str()))
        .cloned()
        .collect()
}

/// Roster of connected users for one room.
pub struct AwarenessRegistry<T: RoomTransport> {
    transport: Arc<T>,
    local: Mutex<Option<AwarenessState>>,
    roster_tx: watch::Sender<Vec<AwarenessState>>,
    settle_delay: Duration,
    settle: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: RoomTransport> AwarenessRegistry<T> {
    pub fn new(transport: Arc<T>, settle_delay: Duration) -> Self {
        let (roster_tx, _) = watch::channel(Vec::new());
        Self {
            transport,
            local: Mutex::new(None),
            roster_tx,
            settle_delay,
            settle: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Publish the local participant under `name`.
    ///
    /// Publishes immediately, then once more after the settle delay to
    /// cover transports that drop state published during their own startup.
    pub fn set_local_state(&self, name: &str) {
        let state = AwarenessState::for_name(name);
        *self.local.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        self.transport.set_local_state(state.clone());

        let transport = self.transport.clone();
        let delay = self.settle_delay;
        let settle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            log::trace!("Republishing awareness for {} after settle delay", state.name);
            transport.set_local_state(state);
        });
        let previous = self
            .settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(settle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-send the local state, if one was set.
    pub fn republish(&self) {
        if let Some(state) = self.local_state() {
            self.transport.set_local_state(state);
        }
    }

    /// Recompute the roster from the transport's table. Listeners are only
    /// woken when the projection actually changed.
    pub fn refresh(&self) {
        let roster = project_roster(&self.transport.all_states());
        self.roster_tx.send_if_modified(|current| {
            if *current == roster {
                false
            } else {
                *current = roster;
                true
            }
        });
    }

    /// Fold one transport event into the registry.
    pub fn handle_event(&self, event: &RoomEvent) {
        match event {
            RoomEvent::SyncStatusChanged { synced: true } => {
                log::debug!("Transport synced, republishing local awareness");
                self.republish();
            }
            RoomEvent::AwarenessChanged => self.refresh(),
            RoomEvent::SyncStatusChanged { synced: false } | RoomEvent::Update(_) => {}
        }
    }

    /// Current roster.
    pub fn roster(&self) -> Vec<AwarenessState> {
        self.roster_tx.borrow().clone()
    }

    /// Watch the roster.
    pub fn users(&self) -> watch::Receiver<Vec<AwarenessState>> {
        self.roster_tx.subscribe()
    }

    /// Invoke `callback` on every roster change until shutdown.
    pub fn on_users_changed<F>(&self, callback: F)
    where
        F: Fn(&[AwarenessState]) + Send + 'static,
    {
        let mut rx = self.roster_tx.subscribe();
        let listener = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let users = rx.borrow_and_update().clone();
                callback(&users);
            }
        });
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Stop the settle timer and every listener. No callback fires after
    /// this returns.
    pub fn shutdown(&self) {
        if let Some(settle) = self.settle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            settle.abort();
        }
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            listener.abort();
        }
    }
}

impl<T: RoomTransport> Drop for AwarenessRegistry<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
