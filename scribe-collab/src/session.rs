//! Collaborative session: one shared CRDT document bound to one room.
//!
//! ```text
//!            edit surface
//!                 │ insert / publish_local_changes()
//!                 ▼
//! ┌───────────────────────────────┐   diff vs. last published SV
//! │ SharedDocument (yrs::Doc)     │ ─────────────────────────────► transport.send_update
//! └───────────────▲───────────────┘
//!                 │ apply
//!   ┌─────────────┴──────────┐
//!   │ event pump             │ ◄── RoomEvent::{Update, SyncStatusChanged, AwarenessChanged}
//!   └─────────────┬──────────┘
//!                 ▼
//!        AwarenessRegistry (roster)
//! ```
//!
//! The document and the transport are created together by [`open`] and
//! released together by [`close`]; there is no state holding one without
//! the other.
//!
//! [`open`]: CollaborativeSession::open
//! [`close`]: CollaborativeSession::close

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::awareness::AwarenessRegistry;
use crate::config::SessionConfig;
use crate::protocol::Snapshot;
use crate::transport::{RoomConnector, RoomEvent, RoomTransport, TransportError};

/// The CRDT document shared by everyone in a room.
pub struct SharedDocument {
    doc: Doc,
    /// State vector covered by the last published local diff.
    published: Mutex<StateVector>,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    /// Name of the root text the edit surface binds to.
    pub const TEXT: &'static str = "content";

    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            published: Mutex::new(StateVector::default()),
        }
    }

    /// Underlying Yrs document, for edit surfaces that bind to it directly.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Current plain text of the root text.
    pub fn text(&self) -> String {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(Self::TEXT);
        text.get_string(&txn)
    }

    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(Self::TEXT);
        text.insert(&mut txn, index, chunk);
    }

    /// Append at the end of the root text.
    pub fn push(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(Self::TEXT);
        text.push(&mut txn, chunk);
    }

    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(Self::TEXT);
        text.remove_range(&mut txn, index, len);
    }

    /// Full document state as a v1 update.
    pub fn snapshot(&self) -> Snapshot {
        let txn = self.doc.transact();
        Snapshot::new(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Apply a v1 update received from the room. `false` if it was dropped.
    ///
    /// When nothing local is waiting to be published, the published state
    /// vector follows along so the next local diff excludes remote content.
    pub fn apply_remote(&self, update: &[u8]) -> bool {
        let decoded = match Update::decode_v1(update) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping undecodable remote update: {e}");
                return false;
            }
        };
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let mut txn = self.doc.transact_mut();
        let caught_up = txn.state_vector() == *published;
        if let Err(e) = txn.apply_update(decoded) {
            log::warn!("Failed to apply remote update: {e}");
            return false;
        }
        if caught_up {
            *published = txn.state_vector();
        }
        true
    }

    /// Local changes since the last publish, with the state vector that
    /// marks them published.
    fn local_diff(&self) -> Option<(Vec<u8>, StateVector)> {
        let published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = self.doc.transact();
        let current = txn.state_vector();
        if current == *published {
            return None;
        }
        Some((txn.encode_diff_v1(&*published), current))
    }

    fn mark_published(&self, sv: StateVector) {
        *self.published.lock().unwrap_or_else(PoisonError::into_inner) = sv;
    }
}

/// A live collaborative session on one room.
pub struct CollaborativeSession<T: RoomTransport> {
    room: String,
    document: Arc<SharedDocument>,
    transport: Arc<T>,
    awareness: Arc<AwarenessRegistry<T>>,
    synced: watch::Receiver<bool>,
    revision: watch::Receiver<u64>,
    pump: JoinHandle<()>,
}

impl<T: RoomTransport> CollaborativeSession<T> {
    /// Connect to `room` and build the shared document.
    ///
    /// Resolves once the transport is connected and the room's current
    /// state has been applied to the fresh document.
    pub async fn open<C>(connector: &C, room: &str, config: &SessionConfig) -> Result<Self, TransportError>
    where
        C: RoomConnector<Transport = T>,
    {
        let document = Arc::new(SharedDocument::new());
        let transport = Arc::new(connector.connect(room).await?);
        let mut events = transport
            .take_event_rx()
            .ok_or(TransportError::ConnectionClosed)?;
        let awareness = Arc::new(AwarenessRegistry::new(
            transport.clone(),
            config.awareness_settle_delay,
        ));
        let (synced_tx, synced) = watch::channel(false);
        let (revision_tx, revision) = watch::channel(0u64);
        let handler = EventHandler {
            document: document.clone(),
            awareness: awareness.clone(),
            synced_tx,
            revision_tx,
        };

        // Whatever the transport queued during connect (initial room state)
        // lands before `open` returns.
        while let Ok(event) = events.try_recv() {
            handler.handle(event);
        }
        let pump = tokio::spawn(pump_events(events, handler));

        log::info!(
            "Collaborative session on {room} open as connection {}",
            transport.connection_id()
        );
        Ok(Self {
            room: room.to_string(),
            document,
            transport,
            awareness,
            synced,
            revision,
            pump,
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn awareness(&self) -> &AwarenessRegistry<T> {
        &self.awareness
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    /// Bumped after every applied remote update.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    /// Send local edits made since the last call. `Ok(false)` if there
    /// were none.
    pub fn publish_local_changes(&self) -> Result<bool, TransportError> {
        let Some((diff, sv)) = self.document.local_diff() else {
            return Ok(false);
        };
        self.transport.send_update(diff)?;
        self.document.mark_published(sv);
        Ok(true)
    }

    /// Release the transport and the shared document together.
    pub async fn close(self) {
        self.shutdown().await;
    }

    /// Teardown for sessions shared behind an `Arc`: stops event handling
    /// and disconnects; the document goes with the last reference.
    pub(crate) async fn shutdown(&self) {
        self.pump.abort();
        self.awareness.shutdown();
        self.transport.close().await;
        log::info!("Collaborative session on {} closed", self.room);
    }
}

impl<T: RoomTransport> Drop for CollaborativeSession<T> {
    fn drop(&mut self) {
        self.pump.abort();
        self.awareness.shutdown();
    }
}

struct EventHandler<T: RoomTransport> {
    document: Arc<SharedDocument>,
    awareness: Arc<AwarenessRegistry<T>>,
    synced_tx: watch::Sender<bool>,
    revision_tx: watch::Sender<u64>,
}

impl<T: RoomTransport> EventHandler<T> {
    fn handle(&self, event: RoomEvent) {
        match &event {
            RoomEvent::Update(update) => {
                if self.document.apply_remote(update) {
                    self.revision_tx.send_modify(|revision| *revision += 1);
                }
                return;
            }
            RoomEvent::SyncStatusChanged { synced } => {
                log::debug!("Room sync status changed: synced={synced}");
                self.synced_tx.send_replace(*synced);
            }
            RoomEvent::AwarenessChanged => {}
        }
        self.awareness.handle_event(&event);
    }
}

async fn pump_events<T: RoomTransport>(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    handler: EventHandler<T>,
) {
    while let Some(event) = events.recv().await {
        handler.handle(event);
    }
    log::debug!("Room event stream ended");
}
