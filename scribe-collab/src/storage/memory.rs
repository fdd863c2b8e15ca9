//! In-process document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{newest_first, DocumentStore, StoreError};
use crate::protocol::{Document, DocumentPatch};

/// Map-backed [`DocumentStore`] for tests and disk-less embedders.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<Uuid, Document>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a prepared row as-is.
    pub async fn put(&self, document: Document) {
        self.rows.write().await.insert(document.id, document);
    }

    /// Number of successful `update` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryStore {
    async fn read(&self, id: Uuid) -> Result<Document, StoreError> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, patch: DocumentPatch) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.apply(patch);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(&self, owner: Uuid) -> Result<Document, StoreError> {
        let document = Document::new(owner);
        self.rows.write().await.insert(document.id, document.clone());
        log::debug!("Inserted document {} for {owner}", document.id);
        Ok(document)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, owner: Uuid) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<Document> = self
            .rows
            .read()
            .await
            .values()
            .filter(|d| d.owner == owner)
            .cloned()
            .collect();
        newest_first(&mut documents);
        Ok(documents)
    }
}
