//! End-to-end document session tests over the in-process relay.
//!
//! Verifies:
//! - Two participants on a public document see each other in presence and roster
//! - CRDT edits converge between participants
//! - Private documents never touch a room but still report presence
//! - Closing one participant shrinks the other's presence and roster
//! - Debounced content saves coalesce into a single write
//! - A collaborative session persists the merged shared document

use scribe_collab::{
    DocumentPatch, DocumentSession, DocumentStore, EditorStatus, Identity, LocalRelay,
    MemoryStore, Mode, RelayHub, SessionConfig, SessionDeps, SharedDocument, Snapshot, Visibility,
};

use std::sync::Arc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

type Session = DocumentSession<MemoryStore, LocalRelay>;
type Deps = SessionDeps<MemoryStore, LocalRelay, LocalRelay>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Deps for one participant: its own relay client on the shared hub.
fn participant_deps(store: &Arc<MemoryStore>, hub: &Arc<RelayHub>) -> Deps {
    let relay = Arc::new(LocalRelay::with_hub(hub.clone()));
    SessionDeps {
        store: store.clone(),
        presence: relay.clone(),
        rooms: relay,
        config: SessionConfig::for_testing(),
    }
}

async fn create_document(store: &MemoryStore, visibility: Visibility) -> Uuid {
    let doc = store.insert(Uuid::new_v4()).await.unwrap();
    store.update(doc.id, DocumentPatch::visibility(visibility)).await.unwrap();
    doc.id
}

async fn open(deps: &Deps, id: Uuid, name: &str) -> Session {
    DocumentSession::open(deps, id, Identity::new(Uuid::new_v4(), name))
        .await
        .unwrap()
}

async fn wait_ready(session: &Session) {
    let mut status = session.watch_status();
    timeout(Duration::from_secs(2), status.wait_for(|s| *s == EditorStatus::Ready))
        .await
        .expect("session never became ready")
        .unwrap();
}

async fn wait_presence(session: &Session, expected: usize) {
    let mut count = session.presence().unwrap().watch();
    timeout(Duration::from_secs(2), count.wait_for(|c| *c == expected))
        .await
        .unwrap_or_else(|_| panic!("presence never reached {expected}"))
        .unwrap();
}

async fn wait_roster(session: &Session, expected: &[&str]) {
    let collab = session.collaborative().unwrap();
    let mut users = collab.awareness().users();
    let wanted: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    timeout(
        Duration::from_secs(2),
        users.wait_for(|roster| {
            let mut names: Vec<String> = roster.iter().map(|u| u.name.clone()).collect();
            names.sort();
            names == wanted
        }),
    )
    .await
    .unwrap_or_else(|_| panic!("roster never became {expected:?}"))
    .unwrap();
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_participants_share_public_document() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Public).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    let bob = open(&participant_deps(&store, &hub), id, "Bob").await;
    assert_eq!(alice.mode(), Mode::Collaborative);
    assert_eq!(bob.mode(), Mode::Collaborative);

    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_presence(&alice, 2).await;
    wait_presence(&bob, 2).await;
    wait_roster(&alice, &["Alice", "Bob"]).await;
    wait_roster(&bob, &["Alice", "Bob"]).await;

    alice.close().await;
    bob.close().await;
    assert_eq!(hub.stats().await.rooms, 0);
    assert_eq!(hub.stats().await.channels, 0);
}

#[tokio::test]
async fn test_edits_converge_between_participants() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Public).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    let bob = open(&participant_deps(&store, &hub), id, "Bob").await;
    wait_ready(&alice).await;
    wait_ready(&bob).await;

    let alice_collab = alice.collaborative().unwrap();
    let bob_collab = bob.collaborative().unwrap();

    alice_collab.document().push("Hello");
    assert!(alice_collab.publish_local_changes().unwrap());
    assert!(!alice_collab.publish_local_changes().unwrap());

    let mut revision = bob_collab.watch_revision();
    timeout(Duration::from_secs(2), async {
        while bob_collab.document().text() != "Hello" {
            revision.changed().await.unwrap();
        }
    })
    .await
    .expect("bob never saw alice's edit");

    bob_collab.document().push(" world");
    bob_collab.publish_local_changes().unwrap();

    let mut revision = alice_collab.watch_revision();
    timeout(Duration::from_secs(2), async {
        while alice_collab.document().text() != "Hello world" {
            revision.changed().await.unwrap();
        }
    })
    .await
    .expect("alice never saw bob's edit");

    drop(alice_collab);
    drop(bob_collab);
    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_late_joiner_receives_existing_content() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Public).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    wait_ready(&alice).await;
    let alice_collab = alice.collaborative().unwrap();
    alice_collab.document().push("agenda");
    alice_collab.publish_local_changes().unwrap();

    // The relay applies updates before fan-out, so a new joiner's initial
    // state already carries them.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let carol = open(&participant_deps(&store, &hub), id, "Carol").await;
    wait_ready(&carol).await;
    assert_eq!(carol.collaborative().unwrap().document().text(), "agenda");

    drop(alice_collab);
    alice.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_private_document_counts_presence_without_room() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Private).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    let bob = open(&participant_deps(&store, &hub), id, "Bob").await;
    assert_eq!(alice.mode(), Mode::Local);
    assert_eq!(alice.status(), EditorStatus::Ready);
    assert!(alice.roster().is_empty());

    wait_presence(&alice, 2).await;
    wait_presence(&bob, 2).await;
    assert_eq!(hub.stats().await.rooms, 0);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_departure_shrinks_presence_and_roster() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Public).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    let bob = open(&participant_deps(&store, &hub), id, "Bob").await;
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    wait_roster(&alice, &["Alice", "Bob"]).await;
    wait_presence(&alice, 2).await;

    bob.close().await;
    wait_presence(&alice, 1).await;
    wait_roster(&alice, &["Alice"]).await;

    alice.close().await;
}

#[tokio::test]
async fn test_same_participant_twice_counts_once() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Private).await;
    let participant = Uuid::new_v4();

    let first = DocumentSession::open(
        &participant_deps(&store, &hub),
        id,
        Identity::new(participant, "Alice"),
    )
    .await
    .unwrap();
    let second = DocumentSession::open(
        &participant_deps(&store, &hub),
        id,
        Identity::new(participant, "Alice"),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.presence_count(), 1);
    assert_eq!(second.presence_count(), 1);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_burst_of_edits_is_saved_once() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Private).await;
    let writes_before = store.write_count();

    let session = open(&participant_deps(&store, &hub), id, "Alice").await;
    for draft in ["d", "dr", "dra", "draf", "draft"] {
        session.edit_content(Snapshot::from(draft));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(session.saving());

    let mut saving = session.watch_saving();
    timeout(Duration::from_secs(2), saving.wait_for(|s| !*s))
        .await
        .expect("save never finished")
        .unwrap();

    assert_eq!(store.write_count(), writes_before + 1);
    let stored = store.read(id).await.unwrap();
    assert_eq!(stored.content, Some(Snapshot::from("draft")));
    session.close().await;
}

#[tokio::test]
async fn test_collaborative_save_persists_merged_document() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(RelayHub::new());
    let id = create_document(&store, Visibility::Public).await;

    let alice = open(&participant_deps(&store, &hub), id, "Alice").await;
    let bob = open(&participant_deps(&store, &hub), id, "Bob").await;
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    let alice_collab = alice.collaborative().unwrap();
    let bob_collab = bob.collaborative().unwrap();

    alice_collab.document().push("shared");
    alice_collab.publish_local_changes().unwrap();
    let mut revision = bob_collab.watch_revision();
    timeout(Duration::from_secs(2), async {
        while bob_collab.document().text() != "shared" {
            revision.changed().await.unwrap();
        }
    })
    .await
    .expect("bob never saw alice's edit");

    bob_collab.document().push(" notes");
    bob_collab.publish_local_changes().unwrap();
    let mut revision = alice_collab.watch_revision();
    timeout(Duration::from_secs(2), async {
        while alice_collab.document().text() != "shared notes" {
            revision.changed().await.unwrap();
        }
    })
    .await
    .expect("alice never saw bob's edit");

    alice.edit_content(alice_collab.document().snapshot());
    let mut saving = alice.watch_saving();
    timeout(Duration::from_secs(2), saving.wait_for(|s| !*s))
        .await
        .expect("save never finished")
        .unwrap();

    let stored = store.read(id).await.unwrap().content.expect("content was not saved");
    let restored = SharedDocument::new();
    assert!(restored.apply_remote(stored.as_bytes()));
    assert_eq!(restored.text(), "shared notes");

    drop(alice_collab);
    drop(bob_collab);
    alice.close().await;
    bob.close().await;
}
