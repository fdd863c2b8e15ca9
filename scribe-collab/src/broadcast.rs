//! Fan-out hub for presence channels and collaborative rooms.
//!
//! Every subscriber owns an unbounded outbox of [`RelayFrame`]s. The hub
//! keeps per-channel presence records and per-room awareness tables plus an
//! authoritative Yrs document, and fans changes out to the members.
//!
//! The same hub backs the in-process [`crate::local::LocalRelay`] and the
//! WebSocket [`crate::server::RelayServer`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::{AwarenessState, ConnectionId, PresenceRecord, RelayFrame};
use crate::transport::TransportError;

/// Hub-level identity of one subscriber (one outbox).
pub type PeerId = Uuid;

/// Sending half of a subscriber's frame queue.
pub type Outbox = mpsc::UnboundedSender<RelayFrame>;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub channels: usize,
    pub rooms: usize,
}

/// Lock-free counters updated on the fan-out path.
struct AtomicHubStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn deliver(&self, outbox: &Outbox, frame: RelayFrame) {
        if outbox.send(frame).is_ok() {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct ChannelMember {
    outbox: Outbox,
    /// `None` until the member tracks itself.
    record: Option<PresenceRecord>,
}

/// Members of one presence channel.
#[derive(Default)]
struct PresenceGroup {
    members: HashMap<PeerId, ChannelMember>,
}

impl PresenceGroup {
    /// Tracked records, oldest join first.
    fn participants(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> =
            self.members.values().filter_map(|m| m.record).collect();
        records.sort_by_key(|r| (r.joined_at, r.participant_id));
        records
    }

    fn sync_all(&self, channel: &str, stats: &AtomicHubStats) {
        let participants = self.participants();
        for member in self.members.values() {
            stats.deliver(
                &member.outbox,
                RelayFrame::PresenceSync {
                    channel: channel.to_string(),
                    participants: participants.clone(),
                },
            );
        }
    }
}

struct RoomMember {
    peer: PeerId,
    outbox: Outbox,
    state: Option<AwarenessState>,
}

/// One collaborative room: authoritative document plus connections.
struct RoomGroup {
    doc: Doc,
    members: BTreeMap<ConnectionId, RoomMember>,
}

impl RoomGroup {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            members: BTreeMap::new(),
        }
    }

    fn fan_out(&self, from: ConnectionId, frame: &RelayFrame, stats: &AtomicHubStats) {
        for (id, member) in &self.members {
            if *id != from {
                stats.deliver(&member.outbox, frame.clone());
            }
        }
    }
}

/// Presence channels and rooms keyed by name.
pub struct RelayHub {
    channels: RwLock<HashMap<String, PresenceGroup>>,
    rooms: RwLock<HashMap<String, RoomGroup>>,
    next_connection: AtomicU64,
    /// Connections allowed per room.
    room_limit: usize,
    atomic_stats: AtomicHubStats,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            room_limit: usize::MAX,
            atomic_stats: AtomicHubStats::new(),
        }
    }

    /// Hub that refuses room joins beyond `limit` connections.
    pub fn with_room_limit(limit: usize) -> Self {
        Self { room_limit: limit, ..Self::new() }
    }

    // ─── Presence channels ────────────────────────────────────────────

    /// Add `peer` to `channel`, creating it on first use. Every member,
    /// the newcomer included, receives a fresh sync.
    pub async fn subscribe(&self, channel: &str, peer: PeerId, outbox: Outbox) {
        let mut channels = self.channels.write().await;
        let group = channels.entry(channel.to_string()).or_default();
        group.members.insert(peer, ChannelMember { outbox, record: None });
        group.sync_all(channel, &self.atomic_stats);
        log::debug!("Peer {peer} subscribed to {channel} ({} members)", group.members.len());
    }

    /// Record `peer`'s presence on `channel` and resync every member.
    pub async fn track(
        &self,
        channel: &str,
        peer: PeerId,
        record: PresenceRecord,
    ) -> Result<(), TransportError> {
        let mut channels = self.channels.write().await;
        let group = channels
            .get_mut(channel)
            .ok_or_else(|| TransportError::NotSubscribed(channel.to_string()))?;
        let member = group
            .members
            .get_mut(&peer)
            .ok_or_else(|| TransportError::NotSubscribed(channel.to_string()))?;
        member.record = Some(record);
        group.sync_all(channel, &self.atomic_stats);
        Ok(())
    }

    /// Remove `peer` from `channel`. Empty channels are dropped.
    pub async fn unsubscribe(&self, channel: &str, peer: &PeerId) -> bool {
        let mut channels = self.channels.write().await;
        let Some(group) = channels.get_mut(channel) else {
            return false;
        };
        if group.members.remove(peer).is_none() {
            return false;
        }
        if group.members.is_empty() {
            channels.remove(channel);
            log::debug!("Channel {channel} removed (empty)");
        } else {
            group.sync_all(channel, &self.atomic_stats);
        }
        true
    }

    /// Number of tracked participants on a channel.
    pub async fn participant_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |g| g.participants().len())
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Join `room`, creating it on first use. The join acknowledgement
    /// (awareness table plus document state) is queued on `outbox` before
    /// any fan-out can reach it.
    pub async fn join_room(
        &self,
        room: &str,
        peer: PeerId,
        outbox: Outbox,
    ) -> Result<ConnectionId, TransportError> {
        let mut rooms = self.rooms.write().await;
        let group = rooms.entry(room.to_string()).or_insert_with(RoomGroup::new);
        if group.members.len() >= self.room_limit {
            return Err(TransportError::Rejected(format!("room '{room}' is full")));
        }
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let states = group
            .members
            .iter()
            .filter_map(|(id, m)| m.state.clone().map(|s| (*id, s)))
            .collect();
        let document = {
            let txn = group.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        self.atomic_stats.deliver(
            &outbox,
            RelayFrame::Joined {
                room: room.to_string(),
                connection_id,
                states,
                document,
            },
        );

        group.members.insert(connection_id, RoomMember { peer, outbox, state: None });
        log::info!("Connection {connection_id} joined room {room} ({} connections)", group.members.len());
        Ok(connection_id)
    }

    /// Whether `connection_id` in `room` belongs to `peer`.
    pub async fn owns_connection(&self, room: &str, connection_id: ConnectionId, peer: &PeerId) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .and_then(|g| g.members.get(&connection_id))
            .is_some_and(|m| m.peer == *peer)
    }

    /// Replace a connection's awareness entry and fan it out.
    pub async fn set_awareness(
        &self,
        room: &str,
        connection_id: ConnectionId,
        state: Option<AwarenessState>,
    ) -> Result<(), TransportError> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .get_mut(room)
            .ok_or_else(|| TransportError::NotJoined(room.to_string()))?;
        let member = group
            .members
            .get_mut(&connection_id)
            .ok_or_else(|| TransportError::NotJoined(room.to_string()))?;
        member.state = state.clone();
        log::trace!("Awareness update from connection {connection_id} in room {room}");
        let frame = RelayFrame::Awareness {
            room: room.to_string(),
            connection_id,
            state,
        };
        group.fan_out(connection_id, &frame, &self.atomic_stats);
        Ok(())
    }

    /// Apply an update to the room document and fan it out.
    pub async fn apply_update(
        &self,
        room: &str,
        connection_id: ConnectionId,
        update: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .get_mut(room)
            .ok_or_else(|| TransportError::NotJoined(room.to_string()))?;
        if !group.members.contains_key(&connection_id) {
            return Err(TransportError::NotJoined(room.to_string()));
        }

        match Update::decode_v1(&update) {
            Ok(decoded) => {
                let mut txn = group.doc.transact_mut();
                if let Err(e) = txn.apply_update(decoded) {
                    log::warn!("Room {room}: failed to apply update from {connection_id}: {e}");
                }
            }
            Err(e) => {
                log::warn!("Room {room}: dropping undecodable update from {connection_id}: {e}");
                return Ok(());
            }
        }

        let frame = RelayFrame::Update {
            room: room.to_string(),
            connection_id,
            update,
        };
        group.fan_out(connection_id, &frame, &self.atomic_stats);
        Ok(())
    }

    /// Remove a connection, announcing its awareness removal. Empty rooms
    /// are dropped together with their document.
    pub async fn leave_room(&self, room: &str, connection_id: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get_mut(room) else {
            return false;
        };
        if group.members.remove(&connection_id).is_none() {
            return false;
        }
        log::info!("Connection {connection_id} left room {room}");
        if group.members.is_empty() {
            rooms.remove(room);
            log::debug!("Room {room} removed (empty)");
        } else {
            let frame = RelayFrame::Awareness {
                room: room.to_string(),
                connection_id,
                state: None,
            };
            group.fan_out(connection_id, &frame, &self.atomic_stats);
        }
        true
    }

    /// Number of connections in a room.
    pub async fn room_connections(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, |g| g.members.len())
    }

    // ─── Client frames ────────────────────────────────────────────────

    /// Handle one client → relay frame on behalf of `peer`. Replies and
    /// rejections are queued on `outbox`.
    pub async fn handle_client_frame(&self, peer: PeerId, outbox: &Outbox, frame: RelayFrame) {
        let target = frame.target().to_string();
        let result = match frame {
            RelayFrame::Subscribe { channel } => {
                self.subscribe(&channel, peer, outbox.clone()).await;
                Ok(())
            }
            RelayFrame::Track { channel, record } => self.track(&channel, peer, record).await,
            RelayFrame::Unsubscribe { channel } => {
                self.unsubscribe(&channel, &peer).await;
                Ok(())
            }
            RelayFrame::JoinRoom { room } => {
                self.join_room(&room, peer, outbox.clone()).await.map(|_| ())
            }
            RelayFrame::Awareness { room, connection_id, state } => {
                if self.owns_connection(&room, connection_id, &peer).await {
                    self.set_awareness(&room, connection_id, state).await
                } else {
                    Err(TransportError::NotJoined(room))
                }
            }
            RelayFrame::Update { room, connection_id, update } => {
                if self.owns_connection(&room, connection_id, &peer).await {
                    self.apply_update(&room, connection_id, update).await
                } else {
                    Err(TransportError::NotJoined(room))
                }
            }
            RelayFrame::LeaveRoom { room, connection_id } => {
                if self.owns_connection(&room, connection_id, &peer).await {
                    self.leave_room(&room, connection_id).await;
                }
                Ok(())
            }
            RelayFrame::Ping => {
                self.atomic_stats.deliver(outbox, RelayFrame::Pong);
                Ok(())
            }
            other => {
                log::debug!("Peer {peer} sent a relay-only frame: {other:?}");
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Rejected frame from peer {peer}: {e}");
            self.atomic_stats.deliver(
                outbox,
                RelayFrame::Rejected { target, reason: e.to_string() },
            );
        }
    }

    // ─── Peer lifecycle ───────────────────────────────────────────────

    /// Remove `peer` from every channel and room it belongs to.
    pub async fn disconnect_peer(&self, peer: &PeerId) {
        let channel_names: Vec<String> = {
            let channels = self.channels.read().await;
            channels
                .iter()
                .filter(|(_, g)| g.members.contains_key(peer))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for channel in channel_names {
            self.unsubscribe(&channel, peer).await;
        }

        let memberships: Vec<(String, ConnectionId)> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .flat_map(|(name, g)| {
                    g.members
                        .iter()
                        .filter(|(_, m)| m.peer == *peer)
                        .map(|(id, _)| (name.clone(), *id))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (room, connection_id) in memberships {
            self.leave_room(&room, connection_id).await;
        }
    }

    /// Drop every channel and room. Closes all outboxes.
    pub async fn clear(&self) {
        self.channels.write().await.clear();
        self.rooms.write().await.clear();
    }

    /// Get hub statistics (lock-free counters, locked counts).
    pub async fn stats(&self) -> HubStats {
        HubStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            channels: self.channels.read().await.len(),
            rooms: self.rooms.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<RelayFrame>) {
        mpsc::unbounded_channel()
    }

    fn last_sync(rx: &mut mpsc::UnboundedReceiver<RelayFrame>) -> Vec<PresenceRecord> {
        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            if let RelayFrame::PresenceSync { participants, .. } = frame {
                last = Some(participants);
            }
        }
        last.expect("no presence sync received")
    }

    #[tokio::test]
    async fn test_subscribe_sends_sync_to_newcomer() {
        let hub = RelayHub::new();
        let (tx, mut rx) = outbox();
        hub.subscribe("doc:a", Uuid::new_v4(), tx).await;
        assert!(last_sync(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_track_resyncs_all_members() {
        let hub = RelayHub::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        hub.subscribe("doc:a", alice, tx_a).await;
        hub.subscribe("doc:a", bob, tx_b).await;

        hub.track("doc:a", alice, PresenceRecord::new(alice)).await.unwrap();
        hub.track("doc:a", bob, PresenceRecord::new(bob)).await.unwrap();

        assert_eq!(last_sync(&mut rx_a).len(), 2);
        assert_eq!(last_sync(&mut rx_b).len(), 2);
        assert_eq!(hub.participant_count("doc:a").await, 2);
    }

    #[tokio::test]
    async fn test_track_requires_subscription() {
        let hub = RelayHub::new();
        let peer = Uuid::new_v4();
        let err = hub.track("doc:x", peer, PresenceRecord::new(peer)).await.unwrap_err();
        assert_eq!(err, TransportError::NotSubscribed("doc:x".into()));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_channel() {
        let hub = RelayHub::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, _rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        hub.subscribe("doc:a", alice, tx_a).await;
        hub.subscribe("doc:a", bob, tx_b).await;
        hub.track("doc:a", alice, PresenceRecord::new(alice)).await.unwrap();

        assert!(hub.unsubscribe("doc:a", &alice).await);
        assert!(last_sync(&mut rx_b).is_empty());
        assert_eq!(hub.stats().await.channels, 1);

        assert!(hub.unsubscribe("doc:a", &bob).await);
        assert_eq!(hub.stats().await.channels, 0);
        assert!(!hub.unsubscribe("doc:a", &bob).await);
    }

    fn joined(rx: &mut mpsc::UnboundedReceiver<RelayFrame>) -> (ConnectionId, Vec<(ConnectionId, AwarenessState)>, Vec<u8>) {
        match rx.try_recv() {
            Ok(RelayFrame::Joined { connection_id, states, document, .. }) => (connection_id, states, document),
            other => panic!("expected Joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_room_reports_existing_awareness() {
        let hub = RelayHub::new();
        let (tx_a, mut rx_a) = outbox();
        let alice = hub.join_room("room", Uuid::new_v4(), tx_a).await.unwrap();
        assert_eq!(joined(&mut rx_a).0, alice);
        hub.set_awareness("room", alice, Some(AwarenessState::for_name("Alice")))
            .await
            .unwrap();

        let (tx_b, mut rx_b) = outbox();
        let bob = hub.join_room("room", Uuid::new_v4(), tx_b).await.unwrap();
        let (connection_id, states, _) = joined(&mut rx_b);
        assert_eq!(connection_id, bob);
        assert_ne!(bob, alice);
        assert_eq!(states, vec![(alice, AwarenessState::for_name("Alice"))]);
        assert_eq!(hub.room_connections("room").await, 2);
    }

    #[tokio::test]
    async fn test_awareness_fans_out_to_others_only() {
        let hub = RelayHub::new();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        let a = hub.join_room("room", Uuid::new_v4(), tx_a).await.unwrap();
        hub.join_room("room", Uuid::new_v4(), tx_b).await.unwrap();
        joined(&mut rx_a);
        joined(&mut rx_b);

        hub.set_awareness("room", a, Some(AwarenessState::for_name("Alice")))
            .await
            .unwrap();

        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            RelayFrame::Awareness { connection_id, state, .. } => {
                assert_eq!(connection_id, a);
                assert_eq!(state.unwrap().name, "Alice");
            }
            other => panic!("expected Awareness, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_joiner_receives_document_state() {
        let hub = RelayHub::new();
        let (tx_a, _rx_a) = outbox();
        let a = hub.join_room("room", Uuid::new_v4(), tx_a).await.unwrap();

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "shared");
        }
        let update = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        hub.apply_update("room", a, update).await.unwrap();

        let (tx_b, mut rx_b) = outbox();
        hub.join_room("room", Uuid::new_v4(), tx_b).await.unwrap();
        let (_, _, document) = joined(&mut rx_b);

        let replica = Doc::new();
        {
            let mut txn = replica.transact_mut();
            txn.apply_update(Update::decode_v1(&document).unwrap()).unwrap();
        }
        let txn = replica.transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "shared");
    }

    #[tokio::test]
    async fn test_leave_room_announces_removal_and_cleans_up() {
        let hub = RelayHub::new();
        let (tx_a, _rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();
        let a = hub.join_room("room", Uuid::new_v4(), tx_a).await.unwrap();
        let b = hub.join_room("room", Uuid::new_v4(), tx_b).await.unwrap();
        joined(&mut rx_b);

        assert!(hub.leave_room("room", a).await);
        assert_eq!(
            rx_b.try_recv().unwrap(),
            RelayFrame::Awareness { room: "room".into(), connection_id: a, state: None }
        );
        assert!(hub.leave_room("room", b).await);
        assert_eq!(hub.stats().await.rooms, 0);
    }

    #[tokio::test]
    async fn test_client_frame_rejects_foreign_connection() {
        let hub = RelayHub::new();
        let (owner_tx, _owner_rx) = outbox();
        let a = hub.join_room("room", Uuid::new_v4(), owner_tx).await.unwrap();

        let intruder = Uuid::new_v4();
        let (tx, mut rx) = outbox();
        hub.handle_client_frame(
            intruder,
            &tx,
            RelayFrame::Awareness {
                room: "room".into(),
                connection_id: a,
                state: Some(AwarenessState::for_name("Mallory")),
            },
        )
        .await;

        assert!(matches!(rx.try_recv(), Ok(RelayFrame::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_room_limit_rejects_extra_connection() {
        let hub = RelayHub::with_room_limit(1);
        let (tx_a, _rx_a) = outbox();
        hub.join_room("room", Uuid::new_v4(), tx_a).await.unwrap();

        let (tx_b, mut rx_b) = outbox();
        hub.handle_client_frame(Uuid::new_v4(), &tx_b, RelayFrame::JoinRoom { room: "room".into() })
            .await;
        assert!(matches!(rx_b.try_recv(), Ok(RelayFrame::Rejected { .. })));
        assert_eq!(hub.room_connections("room").await, 1);
    }

    #[tokio::test]
    async fn test_client_frame_ping_pong() {
        let hub = RelayHub::new();
        let (tx, mut rx) = outbox();
        hub.handle_client_frame(Uuid::new_v4(), &tx, RelayFrame::Ping).await;
        assert_eq!(rx.try_recv().unwrap(), RelayFrame::Pong);
    }

    #[tokio::test]
    async fn test_disconnect_peer_leaves_everything() {
        let hub = RelayHub::new();
        let peer = Uuid::new_v4();
        let (tx, _rx) = outbox();
        hub.subscribe("doc:a", peer, tx.clone()).await;
        hub.track("doc:a", peer, PresenceRecord::new(peer)).await.unwrap();
        hub.join_room("room", peer, tx).await.unwrap();

        hub.disconnect_peer(&peer).await;
        let stats = hub.stats().await;
        assert_eq!(stats.channels, 0);
        assert_eq!(stats.rooms, 0);
    }

    #[tokio::test]
    async fn test_stats_count_dropped_frames() {
        let hub = RelayHub::new();
        let (tx, rx) = outbox();
        drop(rx);
        hub.subscribe("doc:a", Uuid::new_v4(), tx).await;
        let stats = hub.stats().await;
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.frames_dropped, 1);
    }
}
