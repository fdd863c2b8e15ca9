//! Durable document storage.
//!
//! ```text
//! PersistenceCoordinator ──update()──► DocumentStore
//! DocumentSession        ──read()────►      │
//!                                           ├── MemoryStore (in-process map)
//!                                           └── RocksStore  (RocksDB)
//!                                                 ├── CF "documents": row metadata (bincode)
//!                                                 └── CF "content":   snapshots (LZ4)
//! ```
//!
//! The core only ever writes through [`DocumentStore::update`] with a
//! partial [`DocumentPatch`]; it never reads a row back to merge it.

pub mod memory;
pub mod rocks;

use std::future::Future;
use uuid::Uuid;

use crate::protocol::{Document, DocumentPatch};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors. The core logs them and does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Read/write contract of the durable document store.
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch one document row.
    fn read(&self, id: Uuid) -> impl Future<Output = Result<Document, StoreError>> + Send;

    /// Apply a partial update. `last_updated` never moves backwards.
    fn update(
        &self,
        id: Uuid,
        patch: DocumentPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create an empty private document titled "Untitled".
    fn insert(&self, owner: Uuid) -> impl Future<Output = Result<Document, StoreError>> + Send;

    fn delete(&self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Documents owned by `owner`, most recently updated first.
    fn list(&self, owner: Uuid) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;
}

/// Sort rows most recently updated first.
pub(crate) fn newest_first(documents: &mut [Document]) {
    documents.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then(a.id.cmp(&b.id)));
}
