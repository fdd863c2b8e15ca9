//! Data model and binary wire frames.
//!
//! The document types mirror the rows of the durable store. Everything the
//! relay exchanges travels as a bincode-encoded [`RelayFrame`]:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────┐
//! │ variant tag  │ channel / room name, then variant payload │
//! │ varint       │ variable                                  │
//! └──────────────┴───────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::awareness::DisplayColor;

/// Per-room connection identifier assigned by the relay.
pub type ConnectionId = u64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Presence channel name for a document.
pub fn channel_name(doc_id: Uuid) -> String {
    format!("doc:{doc_id}")
}

/// Who may see a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn toggled(self) -> Self {
        match self {
            Visibility::Private => Visibility::Public,
            Visibility::Public => Visibility::Private,
        }
    }
}

/// Opaque rich-text snapshot produced by the edit surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Snapshot {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// A document row as held by the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner: Uuid,
    pub title: String,
    /// `None` until the first content write.
    pub content: Option<Snapshot>,
    pub visibility: Visibility,
    /// Milliseconds since the Unix epoch.
    pub last_updated: u64,
}

impl Document {
    /// Title given to freshly inserted documents.
    pub const DEFAULT_TITLE: &'static str = "Untitled";

    /// A new, empty, private document.
    pub fn new(owner: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            title: Self::DEFAULT_TITLE.to_string(),
            content: None,
            visibility: Visibility::Private,
            last_updated: now_millis(),
        }
    }

    /// Apply a partial update. `last_updated` never moves backwards.
    pub fn apply(&mut self, patch: DocumentPatch) {
        if let Some(content) = patch.content {
            self.content = Some(content);
        }
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(visibility) = patch.visibility {
            self.visibility = visibility;
        }
        if let Some(ts) = patch.last_updated {
            self.last_updated = self.last_updated.max(ts);
        }
    }
}

/// Partial update of a document row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub content: Option<Snapshot>,
    pub title: Option<String>,
    pub visibility: Option<Visibility>,
    pub last_updated: Option<u64>,
}

impl DocumentPatch {
    pub fn content(snapshot: Snapshot) -> Self {
        Self { content: Some(snapshot), ..Self::default() }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..Self::default() }
    }

    pub fn visibility(visibility: Visibility) -> Self {
        Self { visibility: Some(visibility), ..Self::default() }
    }

    /// Stamp the patch with a `last_updated` value.
    pub fn stamped(mut self, at: u64) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.title.is_none()
            && self.visibility.is_none()
            && self.last_updated.is_none()
    }
}

/// Liveness announcement on a document's presence channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub participant_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub joined_at: u64,
}

impl PresenceRecord {
    pub fn new(participant_id: Uuid) -> Self {
        Self { participant_id, joined_at: now_millis() }
    }
}

/// Ephemeral per-connection identity published on a room's awareness bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    pub color: DisplayColor,
}

impl AwarenessState {
    /// State for `name` with its derived display color.
    pub fn for_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let color = DisplayColor::from_name(&name);
        Self { name, color }
    }
}

/// Frames exchanged between relay clients and the relay hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay: join a presence channel.
    Subscribe { channel: String },
    /// Client → relay: announce liveness on a joined channel.
    Track { channel: String, record: PresenceRecord },
    /// Client → relay: leave a presence channel.
    Unsubscribe { channel: String },
    /// Relay → client: full list of tracked records on a channel.
    PresenceSync { channel: String, participants: Vec<PresenceRecord> },

    /// Client → relay: connect to a collaborative room.
    JoinRoom { room: String },
    /// Relay → client: room joined; carries the current awareness table
    /// and the room's document state as a v1 update.
    Joined {
        room: String,
        connection_id: ConnectionId,
        states: Vec<(ConnectionId, AwarenessState)>,
        document: Vec<u8>,
    },
    /// Either direction: a connection's awareness state changed.
    /// `None` removes the entry.
    Awareness {
        room: String,
        connection_id: ConnectionId,
        state: Option<AwarenessState>,
    },
    /// Either direction: an incremental CRDT update.
    Update {
        room: String,
        connection_id: ConnectionId,
        update: Vec<u8>,
    },
    /// Client → relay: disconnect from a room.
    LeaveRoom { room: String, connection_id: ConnectionId },

    /// Relay → client: a request could not be honored. `target` is the
    /// channel or room the request named.
    Rejected { target: String, reason: String },

    Ping,
    Pong,
}

impl RelayFrame {
    /// Channel or room a frame refers to; empty for connection-level frames.
    pub fn target(&self) -> &str {
        match self {
            RelayFrame::Subscribe { channel }
            | RelayFrame::Track { channel, .. }
            | RelayFrame::Unsubscribe { channel }
            | RelayFrame::PresenceSync { channel, .. } => channel,
            RelayFrame::JoinRoom { room }
            | RelayFrame::Joined { room, .. }
            | RelayFrame::Awareness { room, .. }
            | RelayFrame::Update { room, .. }
            | RelayFrame::LeaveRoom { room, .. } => room,
            RelayFrame::Rejected { target, .. } => target,
            RelayFrame::Ping | RelayFrame::Pong => "",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_scoped_by_document() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(channel_name(id), "doc:550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_visibility_toggle() {
        assert_eq!(Visibility::Private.toggled(), Visibility::Public);
        assert_eq!(Visibility::Public.toggled(), Visibility::Private);
        assert_eq!(Visibility::default(), Visibility::Private);
    }

    #[test]
    fn test_new_document_defaults() {
        let owner = Uuid::new_v4();
        let doc = Document::new(owner);
        assert_eq!(doc.owner, owner);
        assert_eq!(doc.title, "Untitled");
        assert_eq!(doc.visibility, Visibility::Private);
        assert!(doc.content.is_none());
    }

    #[test]
    fn test_apply_patch_keeps_untouched_fields() {
        let mut doc = Document::new(Uuid::new_v4());
        doc.apply(DocumentPatch::title("Notes").stamped(doc.last_updated + 10));
        assert_eq!(doc.title, "Notes");
        assert!(doc.content.is_none());
        assert_eq!(doc.visibility, Visibility::Private);

        doc.apply(DocumentPatch::content(Snapshot::from("hello")));
        assert_eq!(doc.title, "Notes");
        assert_eq!(doc.content.as_ref().map(|s| s.as_bytes()), Some(&b"hello"[..]));
    }

    #[test]
    fn test_apply_patch_timestamp_is_monotonic() {
        let mut doc = Document::new(Uuid::new_v4());
        doc.last_updated = 1_000;
        doc.apply(DocumentPatch::visibility(Visibility::Public).stamped(500));
        assert_eq!(doc.last_updated, 1_000);
        assert_eq!(doc.visibility, Visibility::Public);
        doc.apply(DocumentPatch::default().stamped(2_000));
        assert_eq!(doc.last_updated, 2_000);
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(DocumentPatch::default().is_empty());
        assert!(!DocumentPatch::title("x").is_empty());
        assert!(!DocumentPatch::default().stamped(1).is_empty());
    }

    #[test]
    fn test_joined_frame_roundtrip() {
        let frame = RelayFrame::Joined {
            room: "room-1".into(),
            connection_id: 7,
            states: vec![(3, AwarenessState::for_name("Alice"))],
            document: vec![1, 0],
        };
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_target() {
        assert_eq!(RelayFrame::Subscribe { channel: "doc:a".into() }.target(), "doc:a");
        assert_eq!(RelayFrame::JoinRoom { room: "r".into() }.target(), "r");
        assert_eq!(RelayFrame::Ping.target(), "");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(RelayFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_awareness_state_for_name_uses_derived_color() {
        let state = AwarenessState::for_name("Bob");
        assert_eq!(state.color, DisplayColor::from_name("Bob"));
    }
}
