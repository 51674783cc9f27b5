//! A deduplicating, delay-capable work queue keyed by [`ResourceKey`]
//!
//! The queue only ever stores keys. Any number of [`WorkQueue::add`] calls for the same key collapse
//! into a single pending item, and a key that is handed out by [`WorkQueue::get`] is held "in
//! processing" until it is returned with [`WorkQueue::done`]. An `add` that arrives while the key
//! is being processed is remembered as a follow-up instead of creating a second processing slot,
//! so no two workers ever hold the same key at once.
use crate::utils::ItemBackoff;
use hashbrown::{hash_map::Entry, HashMap};
use kube_fleet_core::{ClusterId, ResourceKey};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// How a claimed key was handled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handled, nothing further to do until the next change
    Success,
    /// Handled, but should be looked at again after the given delay
    Requeue(Duration),
    /// Failed in a way that may succeed later, retry with backoff
    Failure,
    /// Failed permanently, do not retry until the next change
    Terminal,
}

/// A key handed out by [`WorkQueue::get`]
///
/// The holder is the only one processing this key until it calls [`WorkQueue::done`].
#[derive(Debug)]
pub struct Claim {
    key: ResourceKey,
    attempts: u32,
    cancel: CancellationToken,
}

impl Claim {
    /// The claimed key
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// How many consecutive failed attempts preceded this one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the work was cancelled because its cluster left the fleet or the queue shut down
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the work is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Retry bookkeeping for one key
#[derive(Debug)]
struct QueueItem {
    enqueued_at: Instant,
    attempts: u32,
    not_before: Instant,
    /// Position in the ready index, `None` while processing
    slot: Option<(Instant, u64)>,
    processing: bool,
    /// Earliest time a follow-up `add` asked for while processing
    follow_up: Option<Instant>,
    /// The key's cluster was forgotten while it was being processed
    forgotten: bool,
}

#[derive(Default)]
struct State {
    items: HashMap<ResourceKey, QueueItem>,
    /// Idle items ordered by `not_before`, the counter breaks ties in insertion order
    ready: BTreeMap<(Instant, u64), ResourceKey>,
    seq: u64,
    /// One cancellation scope per cluster with work in flight
    clusters: HashMap<ClusterId, CancellationToken>,
}

impl State {
    fn schedule(&mut self, key: &ResourceKey, at: Instant) {
        let seq = self.seq;
        self.seq += 1;
        if let Some(item) = self.items.get_mut(key) {
            if let Some(old) = item.slot.take() {
                self.ready.remove(&old);
            }
            item.not_before = at;
            item.slot = Some((at, seq));
            self.ready.insert((at, seq), key.clone());
        }
    }

    fn remove(&mut self, key: &ResourceKey) {
        if let Some(item) = self.items.remove(key) {
            if let Some(slot) = item.slot {
                self.ready.remove(&slot);
            }
        }
    }

    fn pop_ready(&mut self, now: Instant) -> Option<ResourceKey> {
        let (&slot, _) = self.ready.first_key_value()?;
        if slot.0 > now {
            return None;
        }
        let key = self.ready.remove(&slot)?;
        if let Some(item) = self.items.get_mut(&key) {
            item.slot = None;
            item.processing = true;
        }
        Some(key)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.ready.first_key_value().map(|(slot, _)| slot.0)
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    backoff: ItemBackoff,
    shutdown: CancellationToken,
}

/// A shared work queue, see the [module documentation](self)
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ItemBackoff::default())
    }
}

impl WorkQueue {
    /// Create an empty queue that retries failures with `backoff`
    #[must_use]
    pub fn new(backoff: ItemBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue `key` for processing as soon as possible
    ///
    /// If the key is already pending nothing changes, in particular a pending retry keeps its
    /// backoff delay. If the key is being processed a follow-up is recorded instead.
    pub fn add(&self, key: ResourceKey) {
        self.add_at(key, Instant::now());
    }

    /// Enqueue `key` for processing no earlier than `delay` from now
    ///
    /// Follows the same rules as [`WorkQueue::add`] for keys that are already known.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        self.add_at(key, Instant::now() + delay);
    }

    fn add_at(&self, key: ResourceKey, at: Instant) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        match state.items.entry(key) {
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(QueueItem {
                    enqueued_at: now,
                    attempts: 0,
                    not_before: at,
                    slot: None,
                    processing: false,
                    follow_up: None,
                    forgotten: false,
                });
                tracing::trace!(%key, "queued");
                state.schedule(&key, at);
            }
            Entry::Occupied(mut entry) if entry.get().processing => {
                let item = entry.get_mut();
                item.follow_up = Some(item.follow_up.map_or(at, |prev| prev.min(at)));
                item.forgotten = false;
                tracing::trace!(key = %entry.key(), "queued follow-up for key in processing");
                return;
            }
            // already pending: a burst of changes must not shorten a pending retry
            Entry::Occupied(_) => return,
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for a key that is due and claim it
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<Claim> {
        loop {
            let notified = self.inner.notify.notified();
            let deadline = {
                let mut state = self.inner.state.lock();
                if self.inner.shutdown.is_cancelled() {
                    return None;
                }
                if let Some(key) = state.pop_ready(Instant::now()) {
                    let root = &self.inner.shutdown;
                    let cancel = state
                        .clusters
                        .entry(key.cluster.clone())
                        .or_insert_with(|| root.child_token())
                        .child_token();
                    let attempts = state.items.get(&key).map_or(0, |item| item.attempts);
                    let more_ready = state.next_deadline().is_some_and(|at| at <= Instant::now());
                    drop(state);
                    if more_ready {
                        self.inner.notify.notify_one();
                    }
                    tracing::trace!(%key, attempts, "claimed");
                    return Some(Claim { key, attempts, cancel });
                }
                state.next_deadline()
            };
            let sleep = async {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = notified => {},
                () = sleep => {},
                () = self.inner.shutdown.cancelled() => return None,
            }
        }
    }

    /// Release a claimed key, scheduling follow-up work according to `outcome`
    pub fn done(&self, claim: Claim, outcome: &Outcome) {
        let Claim { key, .. } = claim;
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        let Some(item) = state.items.get_mut(&key) else {
            return;
        };
        if !item.processing {
            tracing::warn!(%key, "released a key that was not being processed");
            return;
        }
        item.processing = false;
        if item.forgotten {
            tracing::debug!(%key, "dropping key of forgotten cluster");
            state.remove(&key);
            return;
        }
        let follow_up = item.follow_up.take();
        let next = match outcome {
            Outcome::Success | Outcome::Terminal => {
                item.attempts = 0;
                follow_up
            }
            Outcome::Requeue(delay) => {
                item.attempts = 0;
                let at = now + *delay;
                Some(follow_up.map_or(at, |f| f.min(at)))
            }
            Outcome::Failure => {
                item.attempts = item.attempts.saturating_add(1);
                let delay = self.inner.backoff.delay(item.attempts);
                tracing::debug!(%key, attempts = item.attempts, ?delay, "backing off");
                Some(now + delay)
            }
        };
        match next {
            Some(at) => {
                state.schedule(&key, at);
                drop(state);
                self.inner.notify.notify_one();
            }
            None => state.remove(&key),
        }
    }

    /// Drop every item belonging to `cluster` and cancel its in-flight work
    ///
    /// Returns the number of keys that were dropped or marked for dropping.
    #[must_use]
    pub fn forget_cluster(&self, cluster: &ClusterId) -> usize {
        let mut state = self.inner.state.lock();
        if let Some(token) = state.clusters.remove(cluster) {
            token.cancel();
        }
        let keys: Vec<ResourceKey> = state
            .items
            .keys()
            .filter(|key| key.cluster == *cluster)
            .cloned()
            .collect();
        for key in &keys {
            let in_flight = state.items.get_mut(key).is_some_and(|item| {
                if item.processing {
                    item.forgotten = true;
                    item.follow_up = None;
                }
                item.processing
            });
            if !in_flight {
                state.remove(key);
            }
        }
        tracing::debug!(%cluster, keys = keys.len(), "forgot cluster");
        keys.len()
    }

    /// Stop handing out work and drop everything that is queued
    ///
    /// In-flight claims are cancelled, and every pending or future [`WorkQueue::get`] returns `None`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        let dropped = state.items.len();
        *state = State::default();
        drop(state);
        self.inner.notify.notify_waiters();
        tracing::debug!(dropped, "work queue shut down");
    }

    /// Whether [`WorkQueue::shutdown`] was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of distinct keys queued or in processing
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Whether nothing is queued or in processing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently claimed by a worker
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().items.values().filter(|item| item.processing).count()
    }

    /// Consecutive failures recorded for `key`, `None` if the key is unknown
    #[must_use]
    pub fn attempts(&self, key: &ResourceKey) -> Option<u32> {
        self.inner.state.lock().items.get(key).map(|item| item.attempts)
    }

    /// How long the oldest item has been in the queue
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .items
            .values()
            .map(|item| now.saturating_duration_since(item.enqueued_at))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, WorkQueue};
    use crate::utils::ItemBackoff;
    use futures::{poll, FutureExt};
    use kube_fleet_core::{ObjectRef, ResourceKey};
    use parking_lot::Mutex;
    use std::{collections::HashSet, sync::Arc, time::Duration};
    use tokio::time::{advance, pause};

    fn key(cluster: &str, name: &str) -> ResourceKey {
        ResourceKey::new(cluster, ObjectRef::new("Widget", name).within("default"))
    }

    #[tokio::test]
    async fn rapid_adds_collapse_into_one_item() {
        pause();
        let queue = WorkQueue::default();
        for _ in 0..10 {
            queue.add(key("c1", "a"));
        }
        assert_eq!(queue.len(), 1);
        let claim = queue.get().await.unwrap();
        assert_eq!(claim.key(), &key("c1", "a"));
        assert!(poll!(queue.get().boxed()).is_pending());
        queue.done(claim, &Outcome::Success);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn add_during_processing_queues_exactly_one_follow_up() {
        pause();
        let queue = WorkQueue::default();
        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        queue.add(key("c1", "a"));
        queue.add(key("c1", "a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 1);
        // the follow-up must not be handed to a second worker while the first holds the key
        assert!(poll!(queue.get().boxed()).is_pending());

        queue.done(claim, &Outcome::Success);
        let again = queue.get().await.unwrap();
        assert_eq!(again.key(), &key("c1", "a"));
        queue.done(again, &Outcome::Success);
        assert!(queue.is_empty());
        assert!(poll!(queue.get().boxed()).is_pending());
    }

    #[tokio::test]
    async fn failures_back_off_exponentially() {
        pause();
        let queue = WorkQueue::new(ItemBackoff::new(Duration::from_millis(100), Duration::from_secs(1)));
        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        assert_eq!(claim.attempts(), 0);
        queue.done(claim, &Outcome::Failure);
        assert_eq!(queue.attempts(&key("c1", "a")), Some(1));

        assert!(poll!(queue.get().boxed()).is_pending());
        advance(Duration::from_millis(99)).await;
        assert!(queue.get().now_or_never().is_none());
        advance(Duration::from_millis(1)).await;
        let claim = queue.get().await.unwrap();
        assert_eq!(claim.attempts(), 1);

        queue.done(claim, &Outcome::Failure);
        advance(Duration::from_millis(150)).await;
        assert!(queue.get().now_or_never().is_none());
        advance(Duration::from_millis(50)).await;
        let claim = queue.get().await.unwrap();
        assert_eq!(claim.attempts(), 2);
        queue.done(claim, &Outcome::Success);
        assert_eq!(queue.attempts(&key("c1", "a")), None);
    }

    #[tokio::test]
    async fn add_does_not_reset_pending_backoff() {
        pause();
        let queue = WorkQueue::new(ItemBackoff::new(Duration::from_secs(10), Duration::from_secs(60)));
        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        queue.done(claim, &Outcome::Failure);
        queue.add(key("c1", "a"));
        advance(Duration::from_secs(5)).await;
        assert!(queue.get().now_or_never().is_none());
        advance(Duration::from_secs(5)).await;
        assert!(queue.get().now_or_never().flatten().is_some());
    }

    #[tokio::test]
    async fn requeue_is_not_processed_early() {
        pause();
        let queue = WorkQueue::default();
        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        queue.done(claim, &Outcome::Requeue(Duration::from_secs(30)));
        assert_eq!(queue.attempts(&key("c1", "a")), Some(0));
        advance(Duration::from_secs(29)).await;
        assert!(queue.get().now_or_never().is_none());
        advance(Duration::from_secs(1)).await;
        let claim = queue.get().now_or_never().flatten().unwrap();
        assert_eq!(claim.key(), &key("c1", "a"));
    }

    #[tokio::test]
    async fn terminal_drops_item_unless_follow_up_arrived() {
        pause();
        let queue = WorkQueue::default();
        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        queue.done(claim, &Outcome::Terminal);
        assert!(queue.is_empty());

        queue.add(key("c1", "a"));
        let claim = queue.get().await.unwrap();
        queue.add(key("c1", "a"));
        queue.done(claim, &Outcome::Terminal);
        assert_eq!(queue.len(), 1);
        assert!(queue.get().now_or_never().flatten().is_some());
    }

    #[tokio::test]
    async fn forget_cluster_drops_pending_and_cancels_in_flight() {
        pause();
        let queue = WorkQueue::default();
        queue.add(key("c1", "a"));
        queue.add(key("c1", "b"));
        queue.add(key("c2", "a"));
        let in_flight = queue.get().await.unwrap();
        assert_eq!(in_flight.key(), &key("c1", "a"));
        queue.add(key("c1", "a"));

        assert_eq!(queue.forget_cluster(&"c1".into()), 2);
        assert!(in_flight.is_cancelled());
        // a late follow-up for the forgotten key is discarded together with it
        queue.done(in_flight, &Outcome::Success);
        assert_eq!(queue.len(), 1);
        assert!(queue.attempts(&key("c2", "a")).is_some());
    }

    #[tokio::test]
    async fn claims_of_other_clusters_are_not_cancelled() {
        pause();
        let queue = WorkQueue::default();
        queue.add(key("c1", "a"));
        queue.add(key("c2", "a"));
        let first = queue.get().await.unwrap();
        let second = queue.get().await.unwrap();
        assert_eq!(queue.forget_cluster(&"c1".into()), 1);
        let (c1, c2) = if first.key().cluster.as_str() == "c1" {
            (first, second)
        } else {
            (second, first)
        };
        assert!(c1.is_cancelled());
        assert!(!c2.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        pause();
        let queue = WorkQueue::default();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await.is_none() }
        });
        tokio::task::yield_now().await;
        queue.add(key("c1", "a"));
        queue.shutdown();
        queue.add(key("c1", "b"));
        assert!(queue.is_empty());
        // the waiter may have won the race for "a" before shutdown, either way it must finish
        let _ = waiter.await.unwrap();
        assert!(queue.get().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_hands_one_key_to_two_workers() {
        let queue = WorkQueue::new(ItemBackoff::new(Duration::from_millis(1), Duration::from_millis(5)));
        let holders = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let holders = holders.clone();
            workers.push(tokio::spawn(async move {
                let mut processed = 0_u32;
                while let Some(claim) = queue.get().await {
                    assert!(
                        holders.lock().insert(claim.key().clone()),
                        "{} claimed twice",
                        claim.key()
                    );
                    tokio::task::yield_now().await;
                    holders.lock().remove(claim.key());
                    let outcome = if processed % 3 == 0 {
                        Outcome::Failure
                    } else {
                        Outcome::Success
                    };
                    processed += 1;
                    queue.done(claim, &outcome);
                }
                processed
            }));
        }
        for round in 0..200 {
            queue.add(key("c1", &format!("obj-{}", round % 5)));
            queue.add(key("c2", &format!("obj-{}", round % 3)));
            if round % 20 == 0 {
                tokio::task::yield_now().await;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.shutdown();
        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }
        assert!(total > 0);
    }
}
