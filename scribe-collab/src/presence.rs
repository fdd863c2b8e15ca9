//! Document presence: who currently has a document open.
//!
//! ```text
//! join()
//!   │  spawn pump
//!   ▼
//! subscribe("doc:<id>") ──► track(record)
//!   │
//!   ▼
//! next_sync() ──► distinct ids ∪ {self} ──► watch<usize> ──► listeners
//!   │
//!   ▼  (leave / handle dropped / channel gone)
//! unsubscribe()
//! ```
//!
//! Presence is informational only. Failures are logged; the count falls
//! back to the self-only value of 1.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{channel_name, PresenceRecord};
use crate::transport::{PresenceChannel, PresenceSubscription};

/// Number of distinct participants in `participants`, counting `self_id`
/// exactly once whether or not it appears.
pub fn distinct_participants(participants: &[PresenceRecord], self_id: Uuid) -> usize {
    participants
        .iter()
        .map(|record| record.participant_id)
        .chain(std::iter::once(self_id))
        .collect::<HashSet<_>>()
        .len()
}

/// Joins documents' presence channels.
pub struct PresenceTracker<C: PresenceChannel> {
    channel: Arc<C>,
}

impl<C: PresenceChannel> Clone for PresenceTracker<C> {
    fn clone(&self) -> Self {
        Self { channel: self.channel.clone() }
    }
}

impl<C: PresenceChannel> PresenceTracker<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }

    /// Join the presence channel of `document_id` as `participant_id`.
    ///
    /// Never fails: the subscription runs on a background task and the
    /// handle reports a count of 1 until the first sync arrives.
    pub fn join(&self, document_id: Uuid, participant_id: Uuid) -> PresenceHandle {
        let (count_tx, count_rx) = watch::channel(1usize);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = tokio::spawn(pump(
            self.channel.clone(),
            channel_name(document_id),
            PresenceRecord::new(participant_id),
            count_tx,
            shutdown_rx,
        ));
        PresenceHandle {
            document_id,
            participant_id,
            count_rx,
            shutdown: Some(shutdown_tx),
            pump: Some(pump),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

async fn pump<C: PresenceChannel>(
    channel: Arc<C>,
    name: String,
    record: PresenceRecord,
    count_tx: watch::Sender<usize>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut subscription = match channel.subscribe(&name).await {
        Ok(subscription) => subscription,
        Err(e) => {
            log::warn!("Presence subscribe to {name} failed: {e}");
            return;
        }
    };
    log::info!("Participant {} joined presence on {name}", record.participant_id);

    if let Err(e) = subscription.track(record).await {
        log::warn!("Presence track on {name} failed: {e}");
    }

    loop {
        tokio::select! {
            sync = subscription.next_sync() => match sync {
                Some(sync) => {
                    let count = distinct_participants(&sync.participants, record.participant_id);
                    log::debug!("Presence on {name}: {count} participant(s)");
                    count_tx.send_replace(count);
                }
                None => {
                    log::debug!("Presence channel {name} closed by transport");
                    return;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    match subscription.unsubscribe().await {
        Ok(()) => log::info!("Participant {} left presence on {name}", record.participant_id),
        Err(e) => log::warn!("Presence unsubscribe from {name} failed: {e}"),
    }
}

/// A joined presence channel.
///
/// Dropping the handle releases the channel in the background; [`leave`]
/// does the same and waits for it.
///
/// [`leave`]: PresenceHandle::leave
pub struct PresenceHandle {
    document_id: Uuid,
    participant_id: Uuid,
    count_rx: watch::Receiver<usize>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    /// Latest distinct-participant count, self included.
    pub fn count(&self) -> usize {
        *self.count_rx.borrow()
    }

    /// Watch the participant count.
    pub fn watch(&self) -> watch::Receiver<usize> {
        self.count_rx.clone()
    }

    /// Invoke `callback` with the count after every channel sync.
    pub fn on_presence_changed<F>(&self, callback: F)
    where
        F: Fn(usize) + Send + 'static,
    {
        let mut rx = self.count_rx.clone();
        rx.mark_unchanged();
        let listener = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let count = *rx.borrow_and_update();
                callback(count);
            }
        });
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Unsubscribe and wait until the channel is released.
    pub async fn leave(mut self) {
        self.stop_listeners();
        if let Some(shutdown) = self.shutdown.take() {
            // Err: pump already finished.
            let _ = shutdown.send(());
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                log::warn!("Presence pump for {} ended abnormally: {e}", self.document_id);
            }
        }
    }

    fn stop_listeners(&self) {
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            listener.abort();
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        // The pump sees the dropped shutdown sender and unsubscribes.
        self.stop_listeners();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalRelay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_for_count(handle: &PresenceHandle, expected: usize) {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|count| *count == expected))
            .await
            .expect("count never reached")
            .unwrap();
    }

    async fn wait_for_channel_size(relay: &LocalRelay, channel: &str, expected: usize) {
        for _ in 0..200 {
            if relay.hub().participant_count(channel).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel {channel} never reached {expected} participants");
    }

    fn record(id: Uuid) -> PresenceRecord {
        PresenceRecord { participant_id: id, joined_at: 0 }
    }

    #[test]
    fn test_distinct_counts_self_once() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert_eq!(distinct_participants(&[], me), 1);
        assert_eq!(distinct_participants(&[record(me)], me), 1);
        assert_eq!(distinct_participants(&[record(me), record(other), record(other)], me), 2);
    }

    #[tokio::test]
    async fn test_two_participants_see_each_other() {
        let tracker = PresenceTracker::new(Arc::new(LocalRelay::new()));
        let doc = Uuid::new_v4();

        let alice = tracker.join(doc, Uuid::new_v4());
        let bob = tracker.join(doc, Uuid::new_v4());

        wait_for_count(&alice, 2).await;
        wait_for_count(&bob, 2).await;
    }

    #[tokio::test]
    async fn test_same_participant_twice_counts_once() {
        let tracker = PresenceTracker::new(Arc::new(LocalRelay::new()));
        let doc = Uuid::new_v4();
        let me = Uuid::new_v4();

        let first = tracker.join(doc, me);
        let second = tracker.join(doc, me);
        wait_for_count(&first, 1).await;

        let other = tracker.join(doc, Uuid::new_v4());
        wait_for_count(&first, 2).await;
        wait_for_count(&second, 2).await;
        other.leave().await;
    }

    #[tokio::test]
    async fn test_leave_updates_remaining_participant() {
        let relay = Arc::new(LocalRelay::new());
        let tracker = PresenceTracker::new(relay.clone());
        let doc = Uuid::new_v4();

        let alice = tracker.join(doc, Uuid::new_v4());
        let bob = tracker.join(doc, Uuid::new_v4());
        wait_for_count(&alice, 2).await;

        bob.leave().await;
        assert_eq!(relay.hub().participant_count(&channel_name(doc)).await, 1);
        wait_for_count(&alice, 1).await;
    }

    #[tokio::test]
    async fn test_drop_releases_channel() {
        let relay = Arc::new(LocalRelay::new());
        let tracker = PresenceTracker::new(relay.clone());
        let doc = Uuid::new_v4();
        let channel = channel_name(doc);

        let handle = tracker.join(doc, Uuid::new_v4());
        wait_for_channel_size(&relay, &channel, 1).await;

        drop(handle);
        wait_for_channel_size(&relay, &channel, 0).await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_keeps_self_count() {
        let relay = Arc::new(LocalRelay::new());
        relay.shutdown().await;
        let tracker = PresenceTracker::new(relay);

        let handle = tracker.join(Uuid::new_v4(), Uuid::new_v4());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.count(), 1);
        handle.leave().await;
    }

    #[tokio::test]
    async fn test_listener_receives_counts_until_leave() {
        let tracker = PresenceTracker::new(Arc::new(LocalRelay::new()));
        let doc = Uuid::new_v4();

        let alice = tracker.join(doc, Uuid::new_v4());
        let seen = Arc::new(AtomicUsize::new(0));
        let latest = seen.clone();
        alice.on_presence_changed(move |count| latest.store(count, Ordering::SeqCst));

        let bob = tracker.join(doc, Uuid::new_v4());
        wait_for_count(&alice, 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        alice.leave().await;
        bob.leave().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
