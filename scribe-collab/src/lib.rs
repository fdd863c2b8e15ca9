//! # scribe-collab — Collaborative document editing core
//!
//! Opens documents for editing, decides whether an editing session is
//! solitary or shared, and keeps presence, awareness, persistence and
//! export consistent for the lifetime of the session.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │ DocumentSession  │
//!                     └────────┬─────────┘
//!        ┌───────────┬─────────┼────────────┬──────────────┐
//!        ▼           ▼         ▼            ▼              ▼
//!  ModeArbiter  PresenceHandle │   PersistenceCoordinator  ExportPipeline
//!                    │         │            │
//!                    │  CollaborativeSession│
//!                    │   ├ SharedDocument   │
//!                    │   └ AwarenessRegistry│
//!                    ▼         ▼            ▼
//!           PresenceChannel  RoomTransport  DocumentStore
//!             (LocalRelay / RelayClient)    (MemoryStore / RocksStore)
//!                    │         │
//!                    └────┬────┘
//!                         ▼
//!                  RelayHub ◄── RelayServer (WebSocket)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Data model and bincode wire frames
//! - [`transport`] — Presence channel and room transport contracts
//! - [`broadcast`] — Relay hub: channel and room fan-out
//! - [`local`] — In-process relay client
//! - [`client`] / [`server`] — WebSocket relay client and server
//! - [`mode`] — Local vs collaborative decision
//! - [`presence`] — Presence tracking and participant counting
//! - [`awareness`] — Identity publication, roster projection, colors
//! - [`session`] — Shared CRDT document bound to a room
//! - [`persistence`] — Debounced content saves and ordered metadata writes
//! - [`storage`] — Durable document stores
//! - [`export`] — Markdown, HTML and PDF export
//! - [`document`] — The per-document editing session

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod export;
pub mod local;
pub mod mode;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{project_roster, AwarenessRegistry, DisplayColor};
pub use broadcast::{HubStats, RelayHub};
pub use client::{ConnectionState, RelayClient};
pub use config::{RelayConfig, SessionConfig};
pub use document::{DocumentSession, EditorStatus, Identity, SessionDeps, SessionError};
pub use export::{ContentNode, ExportError, ExportFormat, ExportPipeline, Exporter, PdfRenderer};
pub use local::LocalRelay;
pub use mode::{Mode, ModeArbiter};
pub use persistence::{MetadataChange, PersistenceCoordinator};
pub use presence::{distinct_participants, PresenceHandle, PresenceTracker};
pub use protocol::{
    AwarenessState, ConnectionId, Document, DocumentPatch, PresenceRecord, ProtocolError,
    RelayFrame, Snapshot, Visibility,
};
pub use server::{RelayServer, ServerStats};
pub use session::{CollaborativeSession, SharedDocument};
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use transport::{
    PresenceChannel, PresenceSubscription, PresenceSync, RoomConnector, RoomEvent, RoomTransport,
    TransportError,
};
