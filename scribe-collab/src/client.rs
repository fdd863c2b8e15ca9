//! WebSocket relay client.
//!
//! One socket carries every presence channel and room the client uses:
//!
//! ```text
//!  ClientSubscription ─┐                          ┌─► channels[name] ─► PresenceSync
//!  ClientRoomTransport ┼─► outgoing ─► writer ─► ws ─► reader ─┼─► rooms[name] ─► RoomMirror
//!                      │                          └─► pending joins (JoinRoom → Joined)
//! ```
//!
//! The client is created with [`RelayClient::connect`] and torn down with
//! [`RelayClient::shutdown`]; no state outlives it.

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{AwarenessState, ConnectionId, PresenceRecord, RelayFrame};
use crate::transport::{
    PresenceChannel, PresenceSubscription, PresenceSync, RoomConnector, RoomEvent, RoomMirror,
    RoomTransport, TransportError,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type JoinReply = oneshot::Sender<Result<Arc<RoomMirror>, TransportError>>;

/// Routing tables shared by the reader task and the handles.
struct ClientInner {
    outgoing: Mutex<Option<mpsc::UnboundedSender<RelayFrame>>>,
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<PresenceSync>>>,
    rooms: Mutex<HashMap<String, Arc<RoomMirror>>>,
    pending_joins: Mutex<HashMap<String, JoinReply>>,
    state: watch::Sender<ConnectionState>,
}

impl ClientInner {
    fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        match outgoing.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::Shutdown),
        }
    }

    fn dispatch(&self, frame: RelayFrame) {
        match frame {
            RelayFrame::PresenceSync { channel, participants } => {
                let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(tx) = channels.get(&channel) {
                    let _ = tx.send(PresenceSync { participants });
                }
            }
            RelayFrame::Joined { room, connection_id, states, document } => {
                let mirror = Arc::new(RoomMirror::new(room.clone(), connection_id, states, document));
                self.rooms
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(room.clone(), mirror.clone());
                let reply = self
                    .pending_joins
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&room);
                let delivered = reply.is_some_and(|reply| reply.send(Ok(mirror)).is_ok());
                if !delivered {
                    log::debug!("Join of room {room} was abandoned, leaving");
                    self.forget_room(&room, connection_id);
                }
            }
            frame @ (RelayFrame::Awareness { .. } | RelayFrame::Update { .. }) => {
                let mirror = self
                    .rooms
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(frame.target())
                    .cloned();
                match mirror {
                    Some(mirror) => mirror.handle_frame(frame),
                    None => log::debug!("Frame for unknown room {}", frame.target()),
                }
            }
            RelayFrame::Rejected { target, reason } => {
                let reply = self
                    .pending_joins
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&target);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(TransportError::Rejected(reason)));
                    }
                    None => log::warn!("Relay rejected a request for '{target}': {reason}"),
                }
            }
            RelayFrame::Ping => {
                let _ = self.send(RelayFrame::Pong);
            }
            RelayFrame::Pong => log::trace!("Pong from relay"),
            other => log::debug!("Ignoring client-bound frame {other:?}"),
        }
    }

    /// Drop a room locally and tell the relay.
    fn forget_room(&self, room: &str, connection_id: ConnectionId) {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner).remove(room);
        let _ = self.send(RelayFrame::LeaveRoom { room: room.to_string(), connection_id });
    }

    /// Socket gone: close every subscription and mark rooms unsynced.
    fn disconnected(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        self.channels.lock().unwrap_or_else(PoisonError::into_inner).clear();
        for (_, mirror) in self.rooms.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            mirror.disconnected();
        }
        for (_, reply) in self.pending_joins.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            let _ = reply.send(Err(TransportError::ConnectionClosed));
        }
    }
}

/// WebSocket client of a [`crate::server::RelayServer`].
pub struct RelayClient {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RelayClient {
    /// Open a socket to the relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to relay at {url}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let inner = Arc::new(ClientInner {
            outgoing: Mutex::new(Some(out_tx)),
            channels: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            pending_joins: Mutex::new(HashMap::new()),
            state,
        });

        // Writer task: encode outgoing frames in order; close the socket when
        // the queue is closed.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route inbound frames.
        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(frame) => reader_inner.dispatch(frame),
                        Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Relay connection closed");
            reader_inner.disconnected();
        });

        Ok(Self {
            inner,
            reader,
            writer: Mutex::new(Some(writer)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Round-trip a ping through the relay queue.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.inner.send(RelayFrame::Ping)
    }

    /// Close the socket. Open subscriptions end and rooms report unsynced.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        self.reader.abort();
        self.inner.disconnected();
        log::info!("Relay client shut down");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            writer.abort();
        }
    }
}

// ─── Presence ─────────────────────────────────────────────────────────

/// Presence subscription multiplexed on a relay socket. A client holds at
/// most one subscription per channel; subscribing again replaces it.
pub struct ClientSubscription {
    channel: String,
    inner: Arc<ClientInner>,
    syncs: mpsc::UnboundedReceiver<PresenceSync>,
}

impl PresenceChannel for RelayClient {
    type Subscription = ClientSubscription;

    async fn subscribe(&self, channel: &str) -> Result<ClientSubscription, TransportError> {
        self.ensure_open()?;
        let (tx, syncs) = mpsc::unbounded_channel();
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), tx);
        if let Err(e) = self.inner.send(RelayFrame::Subscribe { channel: channel.to_string() }) {
            self.inner
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(channel);
            return Err(e);
        }
        Ok(ClientSubscription {
            channel: channel.to_string(),
            inner: self.inner.clone(),
            syncs,
        })
    }
}

impl PresenceSubscription for ClientSubscription {
    async fn track(&mut self, record: PresenceRecord) -> Result<(), TransportError> {
        self.inner.send(RelayFrame::Track { channel: self.channel.clone(), record })
    }

    async fn next_sync(&mut self) -> Option<PresenceSync> {
        self.syncs.recv().await
    }

    async fn unsubscribe(self) -> Result<(), TransportError> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.channel);
        self.inner.send(RelayFrame::Unsubscribe { channel: self.channel })
    }
}

// ─── Rooms ────────────────────────────────────────────────────────────

/// Room connection multiplexed on a relay socket.
pub struct ClientRoomTransport {
    mirror: Arc<RoomMirror>,
    inner: Arc<ClientInner>,
    closed: AtomicBool,
}

impl RoomConnector for RelayClient {
    type Transport = ClientRoomTransport;

    async fn connect(&self, room: &str) -> Result<ClientRoomTransport, TransportError> {
        self.ensure_open()?;
        if self
            .inner
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(room)
        {
            return Err(TransportError::Rejected(format!("room '{room}' already joined")));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending_joins.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.contains_key(room) {
                return Err(TransportError::Rejected(format!("room '{room}' is already joining")));
            }
            pending.insert(room.to_string(), reply_tx);
        }
        if let Err(e) = self.inner.send(RelayFrame::JoinRoom { room: room.to_string() }) {
            self.inner
                .pending_joins
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(room);
            return Err(e);
        }

        let mirror = reply_rx.await.map_err(|_| TransportError::ConnectionClosed)??;
        log::debug!("Joined room {room} as connection {}", mirror.connection_id());
        Ok(ClientRoomTransport {
            mirror,
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

impl ClientRoomTransport {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.forget_room(self.mirror.room(), self.mirror.connection_id());
        }
    }
}

impl RoomTransport for ClientRoomTransport {
    fn connection_id(&self) -> ConnectionId {
        self.mirror.connection_id()
    }

    fn set_local_state(&self, state: AwarenessState) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("Room {}: dropping awareness publish after close", self.mirror.room());
            return;
        }
        self.mirror.set_local(state.clone());
        let frame = RelayFrame::Awareness {
            room: self.mirror.room().to_string(),
            connection_id: self.mirror.connection_id(),
            state: Some(state),
        };
        if let Err(e) = self.inner.send(frame) {
            log::warn!("Room {}: awareness publish failed: {e}", self.mirror.room());
        }
    }

    fn all_states(&self) -> BTreeMap<ConnectionId, AwarenessState> {
        self.mirror.all_states()
    }

    fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotJoined(self.mirror.room().to_string()));
        }
        self.inner.send(RelayFrame::Update {
            room: self.mirror.room().to_string(),
            connection_id: self.mirror.connection_id(),
            update,
        })
    }

    fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.mirror.take_event_rx()
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for ClientRoomTransport {
    fn drop(&mut self) {
        self.release();
    }
}
