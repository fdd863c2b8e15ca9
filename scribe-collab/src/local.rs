//! In-process relay client.
//!
//! [`LocalRelay`] talks to a [`RelayHub`] directly, without a socket. Several
//! `LocalRelay`s sharing one hub behave like several clients of one relay
//! server, which is how single-process deployments and tests run.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{Outbox, PeerId, RelayHub};
use crate::protocol::{AwarenessState, ConnectionId, PresenceRecord, RelayFrame};
use crate::transport::{
    PresenceChannel, PresenceSubscription, PresenceSync, RoomConnector, RoomEvent, RoomMirror,
    RoomTransport, TransportError,
};

/// In-process transport client for presence channels and rooms.
///
/// Constructed explicitly and shut down explicitly; nothing is global.
pub struct LocalRelay {
    hub: Arc<RelayHub>,
    /// Hub peers opened through this client, released on shutdown.
    peers: Arc<Mutex<HashSet<PeerId>>>,
    shut_down: AtomicBool,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    /// A client with its own private hub.
    pub fn new() -> Self {
        Self::with_hub(Arc::new(RelayHub::new()))
    }

    /// A client of an existing hub.
    pub fn with_hub(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            peers: Arc::new(Mutex::new(HashSet::new())),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Release every channel and room opened through this client. Later
    /// subscribe/connect calls fail with [`TransportError::Shutdown`].
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let peers: Vec<PeerId> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for peer in &peers {
            self.hub.disconnect_peer(peer).await;
        }
        log::info!("Local relay client shut down ({} peers released)", peers.len());
    }

    fn register_peer(&self) -> Result<PeerId, TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Shutdown);
        }
        let peer = Uuid::new_v4();
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).insert(peer);
        Ok(peer)
    }
}

fn forget_peer(peers: &Mutex<HashSet<PeerId>>, peer: &PeerId) {
    peers.lock().unwrap_or_else(PoisonError::into_inner).remove(peer);
}

// ─── Presence ─────────────────────────────────────────────────────────

/// Presence subscription held against a local hub.
pub struct LocalSubscription {
    hub: Arc<RelayHub>,
    peers: Arc<Mutex<HashSet<PeerId>>>,
    channel: String,
    peer: PeerId,
    inbox: mpsc::UnboundedReceiver<RelayFrame>,
}

impl PresenceChannel for LocalRelay {
    type Subscription = LocalSubscription;

    async fn subscribe(&self, channel: &str) -> Result<LocalSubscription, TransportError> {
        let peer = self.register_peer()?;
        let (outbox, inbox) = mpsc::unbounded_channel();
        self.hub.subscribe(channel, peer, outbox).await;
        Ok(LocalSubscription {
            hub: self.hub.clone(),
            peers: self.peers.clone(),
            channel: channel.to_string(),
            peer,
            inbox,
        })
    }
}

impl PresenceSubscription for LocalSubscription {
    async fn track(&mut self, record: PresenceRecord) -> Result<(), TransportError> {
        self.hub.track(&self.channel, self.peer, record).await
    }

    async fn next_sync(&mut self) -> Option<PresenceSync> {
        while let Some(frame) = self.inbox.recv().await {
            if let RelayFrame::PresenceSync { participants, .. } = frame {
                return Some(PresenceSync { participants });
            }
        }
        None
    }

    async fn unsubscribe(self) -> Result<(), TransportError> {
        forget_peer(&self.peers, &self.peer);
        if self.hub.unsubscribe(&self.channel, &self.peer).await {
            Ok(())
        } else {
            Err(TransportError::NotSubscribed(self.channel))
        }
    }
}

// ─── Rooms ────────────────────────────────────────────────────────────

/// Room connection held against a local hub.
///
/// Outgoing frames go through a single writer task so they reach the hub
/// in the order they were produced.
pub struct LocalRoomTransport {
    mirror: Arc<RoomMirror>,
    commands: Mutex<Option<mpsc::UnboundedSender<RelayFrame>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
    peers: Arc<Mutex<HashSet<PeerId>>>,
    peer: PeerId,
}

impl RoomConnector for LocalRelay {
    type Transport = LocalRoomTransport;

    async fn connect(&self, room: &str) -> Result<LocalRoomTransport, TransportError> {
        let peer = self.register_peer()?;
        let (outbox, mut inbox) = mpsc::unbounded_channel();
        if let Err(e) = self.hub.join_room(room, peer, outbox.clone()).await {
            forget_peer(&self.peers, &peer);
            return Err(e);
        }

        let mirror = match inbox.recv().await {
            Some(RelayFrame::Joined { room, connection_id, states, document }) => {
                Arc::new(RoomMirror::new(room, connection_id, states, document))
            }
            _ => {
                forget_peer(&self.peers, &peer);
                return Err(TransportError::ConnectionClosed);
            }
        };

        let reader = {
            let mirror = mirror.clone();
            tokio::spawn(async move {
                while let Some(frame) = inbox.recv().await {
                    mirror.handle_frame(frame);
                }
                mirror.disconnected();
            })
        };

        let (commands, writer) = spawn_writer(self.hub.clone(), peer, outbox);

        Ok(LocalRoomTransport {
            mirror,
            commands: Mutex::new(Some(commands)),
            writer: Mutex::new(Some(writer)),
            reader,
            peers: self.peers.clone(),
            peer,
        })
    }
}

fn spawn_writer(
    hub: Arc<RelayHub>,
    peer: PeerId,
    outbox: Outbox,
) -> (mpsc::UnboundedSender<RelayFrame>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            hub.handle_client_frame(peer, &outbox, frame).await;
        }
        // Transport closed or dropped: release anything the peer still holds.
        hub.disconnect_peer(&peer).await;
    });
    (tx, handle)
}

impl LocalRoomTransport {
    fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        match commands.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

impl RoomTransport for LocalRoomTransport {
    fn connection_id(&self) -> ConnectionId {
        self.mirror.connection_id()
    }

    fn set_local_state(&self, state: AwarenessState) {
        self.mirror.set_local(state.clone());
        let frame = RelayFrame::Awareness {
            room: self.mirror.room().to_string(),
            connection_id: self.mirror.connection_id(),
            state: Some(state),
        };
        if let Err(e) = self.send(frame) {
            log::warn!("Room {}: awareness publish failed: {e}", self.mirror.room());
        }
    }

    fn all_states(&self) -> BTreeMap<ConnectionId, AwarenessState> {
        self.mirror.all_states()
    }

    fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError> {
        self.send(RelayFrame::Update {
            room: self.mirror.room().to_string(),
            connection_id: self.mirror.connection_id(),
            update,
        })
    }

    fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.mirror.take_event_rx()
    }

    async fn close(&self) {
        let leave = RelayFrame::LeaveRoom {
            room: self.mirror.room().to_string(),
            connection_id: self.mirror.connection_id(),
        };
        // A send failure means the writer is already gone; nothing to flush.
        let _ = self.send(leave);
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(commands);
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        forget_peer(&self.peers, &self.peer);
        log::debug!("Connection {} closed room {}", self.mirror.connection_id(), self.mirror.room());
    }
}

impl Drop for LocalRoomTransport {
    fn drop(&mut self) {
        self.reader.abort();
        forget_peer(&self.peers, &self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> RoomEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for room event")
            .expect("room event stream closed")
    }

    #[tokio::test]
    async fn test_subscribe_track_and_sync() {
        let hub = Arc::new(RelayHub::new());
        let alice = LocalRelay::with_hub(hub.clone());
        let bob = LocalRelay::with_hub(hub.clone());

        let mut sub_a = alice.subscribe("doc:1").await.unwrap();
        let mut sub_b = bob.subscribe("doc:1").await.unwrap();
        let (id_a, id_b) = (Uuid::new_v4(), Uuid::new_v4());
        sub_a.track(PresenceRecord::new(id_a)).await.unwrap();
        sub_b.track(PresenceRecord::new(id_b)).await.unwrap();

        let mut last = PresenceSync::default();
        while last.participants.len() < 2 {
            last = sub_a.next_sync().await.unwrap();
        }
        assert_eq!(hub.participant_count("doc:1").await, 2);

        sub_b.unsubscribe().await.unwrap();
        assert_eq!(hub.participant_count("doc:1").await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe("doc:1").await.unwrap();
        sub.next_sync().await.unwrap();

        relay.shutdown().await;
        assert!(sub.next_sync().await.is_none());
        assert!(matches!(relay.subscribe("doc:2").await, Err(TransportError::Shutdown)));
        assert!(matches!(relay.connect("room").await, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_room_awareness_reaches_other_connection() {
        let hub = Arc::new(RelayHub::new());
        let alice = LocalRelay::with_hub(hub.clone());
        let bob = LocalRelay::with_hub(hub.clone());

        let room_a = alice.connect("room").await.unwrap();
        let room_b = bob.connect("room").await.unwrap();
        let mut events_b = room_b.take_event_rx().unwrap();

        room_a.set_local_state(AwarenessState::for_name("Alice"));

        loop {
            if next_event(&mut events_b).await == RoomEvent::AwarenessChanged
                && room_b.all_states().contains_key(&room_a.connection_id())
            {
                break;
            }
        }
        assert_eq!(room_b.all_states()[&room_a.connection_id()].name, "Alice");
    }

    #[tokio::test]
    async fn test_room_close_removes_connection() {
        let relay = LocalRelay::new();
        let transport = relay.connect("room").await.unwrap();
        assert_eq!(relay.hub().room_connections("room").await, 1);

        transport.close().await;
        assert_eq!(relay.hub().room_connections("room").await, 0);
        assert!(transport.send_update(vec![0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_first_events_are_state_then_sync() {
        let relay = LocalRelay::new();
        let transport = relay.connect("room").await.unwrap();
        let mut events = transport.take_event_rx().unwrap();
        assert!(matches!(next_event(&mut events).await, RoomEvent::Update(_)));
        assert_eq!(next_event(&mut events).await, RoomEvent::SyncStatusChanged { synced: true });
    }
}
