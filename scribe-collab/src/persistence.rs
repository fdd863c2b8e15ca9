//! Debounced persistence of editor state.
//!
//! Content and metadata take different paths to the store:
//!
//! ```text
//! on_content_changed ──► pending slot (gen N) ──quiet period──► update(content)
//!        │                     ▲
//!        └── replaces gen N-1 ─┘ (aborted unless already writing)
//!
//! on_metadata_changed ──► ordered queue ──► writer task ──► update(title | visibility)
//!                                              (issues each write on arrival)
//! ```
//!
//! Only the newest snapshot in a quiet window is written. Metadata writes go
//! out immediately and in order, independent of the content slot and of each
//! other's completion.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{now_millis, DocumentPatch, Snapshot, Visibility};
use crate::storage::DocumentStore;

/// A discrete document property change, written without delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataChange {
    /// Title committed by the edit surface.
    Title(String),
    Visibility(Visibility),
}

impl MetadataChange {
    fn into_patch(self) -> DocumentPatch {
        match self {
            MetadataChange::Title(title) => DocumentPatch::title(title),
            MetadataChange::Visibility(visibility) => DocumentPatch::visibility(visibility),
        }
    }
}

struct PendingWrite {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SaveState {
    pending: Option<PendingWrite>,
    in_flight: usize,
}

impl SaveState {
    fn saving(&self) -> bool {
        self.pending.is_some() || self.in_flight > 0
    }
}

struct Shared<S> {
    store: Arc<S>,
    document_id: Uuid,
    state: Mutex<SaveState>,
    saving_tx: watch::Sender<bool>,
}

impl<S: DocumentStore> Shared<S> {
    fn with_state<R>(&self, f: impl FnOnce(&mut SaveState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut *state);
        self.saving_tx.send_if_modified(|saving| {
            let now = state.saving();
            let changed = *saving != now;
            *saving = now;
            changed
        });
        result
    }

    /// Move the timer for `generation` out of the slot into the in-flight
    /// count. `false` if it was superseded meanwhile.
    fn begin_content_write(&self, generation: u64) -> bool {
        self.with_state(|state| {
            let current = state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.generation == generation);
            if current {
                state.pending = None;
                state.in_flight += 1;
            }
            current
        })
    }

    fn finish_write(&self) {
        self.with_state(|state| state.in_flight = state.in_flight.saturating_sub(1));
    }

    async fn write(&self, patch: DocumentPatch, what: &str) {
        let patch = patch.stamped(now_millis());
        match self.store.update(self.document_id, patch).await {
            Ok(()) => log::debug!("Saved {what} of document {}", self.document_id),
            Err(e) => log::error!("Saving {what} of document {} failed: {e}", self.document_id),
        }
        self.finish_write();
    }
}

/// Reconciles in-memory edits of one document with the durable store.
pub struct PersistenceCoordinator<S: DocumentStore> {
    shared: Arc<Shared<S>>,
    quiet_period: Duration,
    next_generation: AtomicU64,
    metadata_tx: Mutex<Option<mpsc::UnboundedSender<MetadataChange>>>,
    closed: AtomicBool,
}

impl<S: DocumentStore> PersistenceCoordinator<S> {
    pub fn new(store: Arc<S>, document_id: Uuid, quiet_period: Duration) -> Self {
        let (saving_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            store,
            document_id,
            state: Mutex::new(SaveState::default()),
            saving_tx,
        });

        let (metadata_tx, mut metadata_rx) = mpsc::unbounded_channel::<MetadataChange>();
        let writer = shared.clone();
        // Each change is issued as soon as it arrives, in arrival order. A
        // write that never resolves holds only its own slot.
        tokio::spawn(async move {
            let mut writes = FuturesUnordered::new();
            loop {
                tokio::select! {
                    biased;
                    change = metadata_rx.recv() => match change {
                        Some(change) => {
                            let writer = writer.clone();
                            writes.push(async move {
                                writer.write(change.into_patch(), "metadata").await;
                            });
                        }
                        None => break,
                    },
                    Some(()) = writes.next(), if !writes.is_empty() => {}
                }
            }
            while writes.next().await.is_some() {}
        });

        Self {
            shared,
            quiet_period,
            next_generation: AtomicU64::new(0),
            metadata_tx: Mutex::new(Some(metadata_tx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.shared.document_id
    }

    /// Schedule `snapshot` to be written once edits go quiet.
    ///
    /// Replaces any snapshot still waiting and restarts the quiet period. A
    /// write that already started is left to finish.
    pub fn on_content_changed(&self, snapshot: Snapshot) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("Ignoring content change after close of {}", self.shared.document_id);
            return;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let quiet_period = self.quiet_period;
        let shared = self.shared.clone();

        self.shared.with_state(|state| {
            let timer = tokio::spawn(async move {
                tokio::time::sleep(quiet_period).await;
                if shared.begin_content_write(generation) {
                    shared.write(DocumentPatch::content(snapshot), "content").await;
                }
            });
            if let Some(previous) = state.pending.replace(PendingWrite { generation, timer }) {
                previous.timer.abort();
            }
        });
    }

    /// Write a metadata change now, after any metadata change queued before it.
    pub fn on_metadata_changed(&self, change: MetadataChange) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("Ignoring metadata change after close of {}", self.shared.document_id);
            return;
        }
        self.shared.with_state(|state| state.in_flight += 1);
        let sent = self
            .metadata_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.send(change).is_ok())
            .unwrap_or(false);
        if !sent {
            log::warn!("Metadata writer for {} is gone", self.shared.document_id);
            self.shared.finish_write();
        }
    }

    /// `true` while a content write is scheduled or any write is in flight.
    pub fn saving(&self) -> bool {
        *self.shared.saving_tx.borrow()
    }

    pub fn watch_saving(&self) -> watch::Receiver<bool> {
        self.shared.saving_tx.subscribe()
    }

    /// Cancel a scheduled content write without flushing it. Queued
    /// metadata writes still complete.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.with_state(|state| {
            if let Some(pending) = state.pending.take() {
                log::debug!("Dropping unsaved content of {}", self.shared.document_id);
                pending.timer.abort();
            }
        });
        self.metadata_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl<S: DocumentStore> Drop for PersistenceCoordinator<S> {
    fn drop(&mut self) {
        self.close();
    }
}
