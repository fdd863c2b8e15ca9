//! One opened document: presence, mode, collaboration and persistence wired
//! together.
//!
//! ```text
//! open()
//!   ├─ store.read(id) ─────────────► Document copy
//!   ├─ ModeArbiter::decide(visibility)
//!   ├─ PresenceTracker::join ──────► presence count (both modes)
//!   ├─ Collaborative? spawn connect ► status Connecting ─► Ready
//!   └─ PersistenceCoordinator ◄──── edit_content / rename / set_visibility
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::mode::{Mode, ModeArbiter};
use crate::persistence::{MetadataChange, PersistenceCoordinator};
use crate::presence::{PresenceHandle, PresenceTracker};
use crate::protocol::{AwarenessState, Document, Snapshot, Visibility};
use crate::session::CollaborativeSession;
use crate::storage::{DocumentStore, StoreError};
use crate::transport::{PresenceChannel, RoomConnector};

/// Errors surfaced by [`DocumentSession::open`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to read document {id}: {source}")]
    Read {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

/// Whether the edit surface may be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorStatus {
    /// Collaborative session still being set up; the editor is withheld.
    Connecting,
    Ready,
}

/// Who is opening the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: Uuid,
    /// Display name published on the awareness bus.
    pub name: String,
}

impl Identity {
    pub fn new(participant_id: Uuid, name: impl Into<String>) -> Self {
        Self { participant_id, name: name.into() }
    }
}

/// Collaborators a session is opened against.
pub struct SessionDeps<S, P, R> {
    pub store: Arc<S>,
    pub presence: Arc<P>,
    pub rooms: Arc<R>,
    pub config: SessionConfig,
}

impl<S, P, R> Clone for SessionDeps<S, P, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            presence: self.presence.clone(),
            rooms: self.rooms.clone(),
            config: self.config.clone(),
        }
    }
}

type CollabSlot<R> = Arc<Mutex<Option<Arc<CollaborativeSession<<R as RoomConnector>::Transport>>>>>;

/// An opened document.
pub struct DocumentSession<S: DocumentStore, R: RoomConnector> {
    document: Mutex<Document>,
    mode: Mode,
    identity: Identity,
    status: watch::Receiver<EditorStatus>,
    presence: Option<PresenceHandle>,
    collaborative: CollabSlot<R>,
    connecting: Option<JoinHandle<()>>,
    persistence: PersistenceCoordinator<S>,
}

impl<S: DocumentStore, R: RoomConnector> DocumentSession<S, R> {
    /// Open `document_id` for `identity`.
    ///
    /// Fails only when the document cannot be read. Presence and room
    /// failures are logged and leave the session usable.
    pub async fn open<P: PresenceChannel>(
        deps: &SessionDeps<S, P, R>,
        document_id: Uuid,
        identity: Identity,
    ) -> Result<Self, SessionError> {
        let document = deps
            .store
            .read(document_id)
            .await
            .map_err(|source| SessionError::Read { id: document_id, source })?;

        let mode = ModeArbiter::decide(document.visibility);
        log::info!("Opening document {document_id} in {mode:?} mode");

        let presence = PresenceTracker::new(deps.presence.clone())
            .join(document_id, identity.participant_id);

        let collaborative: CollabSlot<R> = Arc::new(Mutex::new(None));
        let (status_tx, status) = watch::channel(match mode {
            Mode::Local => EditorStatus::Ready,
            Mode::Collaborative => EditorStatus::Connecting,
        });
        let connecting = mode.is_collaborative().then(|| {
            tokio::spawn(connect(
                deps.rooms.clone(),
                document_id.to_string(),
                deps.config.clone(),
                identity.name.clone(),
                collaborative.clone(),
                status_tx,
            ))
        });

        let persistence = PersistenceCoordinator::new(
            deps.store.clone(),
            document_id,
            deps.config.save_quiet_period,
        );

        Ok(Self {
            document: Mutex::new(document),
            mode,
            identity,
            status,
            presence: Some(presence),
            collaborative,
            connecting,
            persistence,
        })
    }

    pub fn id(&self) -> Uuid {
        self.persistence.document_id()
    }

    /// Decided once at open; never re-evaluated.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Session's copy of the document row.
    pub fn document(&self) -> Document {
        self.document.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self) -> EditorStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<EditorStatus> {
        self.status.clone()
    }

    /// Presence on the document's channel; `None` after close.
    pub fn presence(&self) -> Option<&PresenceHandle> {
        self.presence.as_ref()
    }

    /// Distinct participants with the document open, self included.
    pub fn presence_count(&self) -> usize {
        self.presence.as_ref().map_or(1, PresenceHandle::count)
    }

    /// The collaborative session, once connected.
    pub fn collaborative(&self) -> Option<Arc<CollaborativeSession<R::Transport>>> {
        self.collaborative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connected users. Empty outside a connected collaborative session.
    pub fn roster(&self) -> Vec<AwarenessState> {
        self.collaborative()
            .map(|session| session.awareness().roster())
            .unwrap_or_default()
    }

    pub fn saving(&self) -> bool {
        self.persistence.saving()
    }

    pub fn watch_saving(&self) -> watch::Receiver<bool> {
        self.persistence.watch_saving()
    }

    /// Content changed in the edit surface.
    pub fn edit_content(&self, snapshot: Snapshot) {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .content = Some(snapshot.clone());
        self.persistence.on_content_changed(snapshot);
    }

    /// Title committed in the edit surface.
    pub fn rename(&self, title: impl Into<String>) {
        let title = title.into();
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .title = title.clone();
        self.persistence.on_metadata_changed(MetadataChange::Title(title));
    }

    /// Visibility toggled. The session's mode stays what it was.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .visibility = visibility;
        self.persistence.on_metadata_changed(MetadataChange::Visibility(visibility));
    }

    /// Tear the session down. A pending content write is dropped.
    pub async fn close(mut self) {
        self.persistence.close();
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        if let Some(presence) = self.presence.take() {
            presence.leave().await;
        }
        let collaborative = self
            .collaborative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = collaborative {
            session.shutdown().await;
        }
        log::info!("Closed document {}", self.id());
    }
}

impl<S: DocumentStore, R: RoomConnector> Drop for DocumentSession<S, R> {
    fn drop(&mut self) {
        self.persistence.close();
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        // Presence handle and collaborative session release themselves on drop.
        self.collaborative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn connect<R: RoomConnector>(
    rooms: Arc<R>,
    room: String,
    config: SessionConfig,
    name: String,
    slot: CollabSlot<R>,
    status_tx: watch::Sender<EditorStatus>,
) {
    match CollaborativeSession::open(rooms.as_ref(), &room, &config).await {
        Ok(session) => {
            session.awareness().set_local_state(&name);
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(session));
            status_tx.send_replace(EditorStatus::Ready);
            log::info!("Document {room} ready for collaborative editing");
        }
        Err(e) => {
            log::warn!("Connecting to room {room} failed, editor stays withheld: {e}");
        }
    }
}
