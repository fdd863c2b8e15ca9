//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents` — row metadata (bincode: owner, title, visibility, last_updated)
//! - `content`   — content snapshots (LZ4 compressed, size-prepended)
//!
//! Both are keyed by the 16 document id bytes and always written together
//! in one `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::{newest_first, DocumentStore, StoreError};
use crate::protocol::{Document, DocumentPatch, Snapshot, Visibility};

const CF_DOCUMENTS: &str = "documents";
const CF_CONTENT: &str = "content";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_CONTENT];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Row metadata as stored in the `documents` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    owner: Uuid,
    title: String,
    visibility: Visibility,
    last_updated: u64,
}

impl DocumentRow {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(row)
    }

    fn from_document(document: &Document) -> Self {
        Self {
            owner: document.owner,
            title: document.title.clone(),
            visibility: document.visibility,
            last_updated: document.last_updated,
        }
    }

    fn into_document(self, id: Uuid, content: Option<Snapshot>) -> Document {
        Document {
            id,
            owner: self.owner,
            title: self.title,
            content,
            visibility: self.visibility,
            last_updated: self.last_updated,
        }
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes row read-modify-write inside `update`.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONTENT => {
                // Values are already LZ4 frames.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Synchronous operations ───────────────────────────────────────

    fn load_row(&self, id: Uuid) -> Result<DocumentRow, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => DocumentRow::decode(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn load_content(&self, id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(|bytes| Some(Snapshot::new(bytes)))
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Read a full document row.
    pub fn read_blocking(&self, id: Uuid) -> Result<Document, StoreError> {
        let row = self.load_row(id)?;
        let content = self.load_content(id)?;
        Ok(row.into_document(id, content))
    }

    /// Apply a partial update atomically.
    pub fn update_blocking(&self, id: Uuid, patch: DocumentPatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut row = self.load_row(id)?;
        if let Some(title) = patch.title {
            row.title = title;
        }
        if let Some(visibility) = patch.visibility {
            row.visibility = visibility;
        }
        if let Some(ts) = patch.last_updated {
            row.last_updated = row.last_updated.max(ts);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes(), row.encode()?);
        if let Some(content) = patch.content {
            let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
            batch.put_cf(self.cf(CF_CONTENT)?, id.as_bytes(), compressed);
        }
        self.write(batch)
    }

    /// Store a complete document row, content included.
    pub fn put_blocking(&self, document: &Document) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = document.id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_DOCUMENTS)?,
            key,
            DocumentRow::from_document(document).encode()?,
        );
        match &document.content {
            Some(content) => batch.put_cf(
                self.cf(CF_CONTENT)?,
                key,
                lz4_flex::compress_prepend_size(content.as_bytes()),
            ),
            None => batch.delete_cf(self.cf(CF_CONTENT)?, key),
        }
        self.write(batch)
    }

    pub fn delete_blocking(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_row(id)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes());
        batch.delete_cf(self.cf(CF_CONTENT)?, id.as_bytes());
        self.write(batch)
    }

    pub fn list_blocking(&self, owner: Uuid) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let row = DocumentRow::decode(&value)?;
            if row.owner != owner {
                continue;
            }
            let id = Uuid::from_slice(&key)
                .map_err(|e| StoreError::Deserialization(format!("invalid document key: {e}")))?;
            let content = self.load_content(id)?;
            documents.push(row.into_document(id, content));
        }
        newest_first(&mut documents);
        Ok(documents)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    async fn read(&self, id: Uuid) -> Result<Document, StoreError> {
        self.read_blocking(id)
    }

    async fn update(&self, id: Uuid, patch: DocumentPatch) -> Result<(), StoreError> {
        self.update_blocking(id, patch)
    }

    async fn insert(&self, owner: Uuid) -> Result<Document, StoreError> {
        let document = Document::new(owner);
        self.put_blocking(&document)?;
        log::debug!("Inserted document {} for {owner}", document.id);
        Ok(document)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.delete_blocking(id)
    }

    async fn list(&self, owner: Uuid) -> Result<Vec<Document>, StoreError> {
        self.list_blocking(owner)
    }
}
