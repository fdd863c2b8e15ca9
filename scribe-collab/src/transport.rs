//! Transport contracts for presence channels and collaborative rooms.
//!
//! Both are implemented twice: in-process by [`crate::local::LocalRelay`]
//! and over WebSocket by [`crate::client::RelayClient`]. Components are
//! generic over these traits, so tests substitute the in-process relay
//! without any process-global state.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::protocol::{AwarenessState, ConnectionId, PresenceRecord, ProtocolError, RelayFrame};

/// Transport-level failures. Always treated as transient by the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not subscribed to channel '{0}'")]
    NotSubscribed(String),
    #[error("room '{0}' is not joined")]
    NotJoined(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport has been shut down")]
    Shutdown,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Channel-wide presence state delivered on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceSync {
    pub participants: Vec<PresenceRecord>,
}

/// Broadcast channel used for document presence.
pub trait PresenceChannel: Send + Sync + 'static {
    type Subscription: PresenceSubscription;

    /// Join `channel`. Resolves once the relay has accepted the subscription.
    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;
}

/// An open presence channel subscription.
pub trait PresenceSubscription: Send + 'static {
    /// Announce a record on the channel.
    fn track(
        &mut self,
        record: PresenceRecord,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next channel-wide sync. `None` once the channel is gone.
    fn next_sync(&mut self) -> impl Future<Output = Option<PresenceSync>> + Send;

    /// Leave the channel, releasing it on the relay.
    fn unsubscribe(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Events surfaced by a room transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The transport (re)synchronized with the room, or lost it.
    SyncStatusChanged { synced: bool },
    /// Some entry of the awareness table was added, changed or removed.
    AwarenessChanged,
    /// A v1 CRDT update to apply to the shared document.
    Update(Vec<u8>),
}

/// Opens transports bound to a room.
pub trait RoomConnector: Send + Sync + 'static {
    type Transport: RoomTransport;

    /// Connect to `room`. Resolves once the room state has been received.
    fn connect(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// A live connection to a collaborative room.
///
/// Exposes the ephemeral awareness bus and the CRDT update stream.
pub trait RoomTransport: Send + Sync + 'static {
    /// This connection's id within the room.
    fn connection_id(&self) -> ConnectionId;

    /// Publish this connection's awareness entry.
    fn set_local_state(&self, state: AwarenessState);

    /// Snapshot of the raw per-connection awareness table.
    fn all_states(&self) -> BTreeMap<ConnectionId, AwarenessState>;

    /// Send an incremental update produced locally.
    fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError>;

    /// Take the event receiver (can only be called once).
    fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<RoomEvent>>;

    /// Disconnect from the room.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Client-side mirror of one joined room: the awareness table plus the
/// event queue handed to the session. Shared by both transports.
pub(crate) struct RoomMirror {
    room: String,
    connection_id: ConnectionId,
    states: Mutex<BTreeMap<ConnectionId, AwarenessState>>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
}

impl RoomMirror {
    /// Build the mirror from a join acknowledgement. The initial document
    /// state and the first sync status are queued before anything else.
    pub(crate) fn new(
        room: impl Into<String>,
        connection_id: ConnectionId,
        states: Vec<(ConnectionId, AwarenessState)>,
        document: Vec<u8>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mirror = Self {
            room: room.into(),
            connection_id,
            states: Mutex::new(states.into_iter().collect()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        };
        mirror.emit(RoomEvent::Update(document));
        mirror.emit(RoomEvent::SyncStatusChanged { synced: true });
        mirror.emit(RoomEvent::AwarenessChanged);
        mirror
    }

    pub(crate) fn room(&self) -> &str {
        &self.room
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub(crate) fn set_local(&self, state: AwarenessState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.connection_id, state);
        self.emit(RoomEvent::AwarenessChanged);
    }

    pub(crate) fn all_states(&self) -> BTreeMap<ConnectionId, AwarenessState> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.events_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Fold an inbound relay frame into the mirror.
    pub(crate) fn handle_frame(&self, frame: RelayFrame) {
        match frame {
            RelayFrame::Awareness { connection_id, state, .. } => {
                if connection_id == self.connection_id {
                    return;
                }
                {
                    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
                    match state {
                        Some(state) => {
                            states.insert(connection_id, state);
                        }
                        None => {
                            states.remove(&connection_id);
                        }
                    }
                }
                self.emit(RoomEvent::AwarenessChanged);
            }
            RelayFrame::Update { connection_id, update, .. } => {
                if connection_id != self.connection_id {
                    self.emit(RoomEvent::Update(update));
                }
            }
            other => {
                log::debug!("Room {}: ignoring frame {other:?}", self.room);
            }
        }
    }

    /// Mark the transport as no longer synchronized.
    pub(crate) fn disconnected(&self) {
        self.emit(RoomEvent::SyncStatusChanged { synced: false });
    }

    fn emit(&self, event: RoomEvent) {
        // Receiver gone means the session was torn down; nothing to notify.
        let _ = self.events_tx.send(event);
    }
}
