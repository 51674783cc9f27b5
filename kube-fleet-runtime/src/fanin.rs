//! Funnels change events from every member cluster into one stream
//!
//! [`FanIn`] runs one [`watcher`] per watched kind for every cluster it is given, and turns what
//! the watchers see into [`ChangeEvent`]s on a shared [`FanInEvents`] stream. Events for the same
//! object are forwarded in the order the cluster produced them. Nothing is promised about the
//! relative order of different objects or clusters.
//!
//! Each subscription keeps track of the resource versions it has already forwarded. After a
//! re-list only objects that are new or changed are announced (as [`EventKind::Added`]), and known
//! objects missing from the list are announced as [`EventKind::Deleted`].
use crate::{
    utils::paced_watch,
    watcher::{self, watcher, Event},
};
use futures::{pin_mut, Stream, StreamExt};
use hashbrown::{HashMap, HashSet};
use kube_fleet_core::{
    ChangeEvent, ClusterHandle, ClusterId, ConnectionState, DynamicObject, EventKind, ObjectRef, ResourceKey,
};
use parking_lot::Mutex;
use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// How many events may be buffered before subscriptions have to wait for the consumer
const CAPACITY: usize = 1024;

/// An event together with the subscription generation of the cluster it came from
struct Tagged {
    epoch: u64,
    event: ChangeEvent,
}

/// Clusters whose events are currently accepted, with the generation of their subscriptions
type Active = Arc<Mutex<HashMap<ClusterId, u64>>>;

struct Subscriptions {
    handle: ClusterHandle,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Manages the subscriptions of every member cluster
///
/// Created together with its event stream by [`fan_in`].
pub struct FanIn {
    kinds: Vec<String>,
    tx: mpsc::Sender<Tagged>,
    active: Active,
    clusters: HashMap<ClusterId, Subscriptions>,
    epoch: u64,
    cancel: CancellationToken,
    grace: Duration,
}

/// Create a fan-in for `kinds`, together with the stream its events are delivered on
///
/// Every subscription is cancelled when `cancel` fires. Removing a cluster waits up to `grace`
/// for its subscriptions to finish before aborting them.
#[must_use]
pub fn fan_in(kinds: Vec<String>, cancel: CancellationToken, grace: Duration) -> (FanIn, FanInEvents) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    let active = Active::default();
    let fan_in = FanIn {
        kinds,
        tx,
        active: active.clone(),
        clusters: HashMap::new(),
        epoch: 0,
        cancel,
        grace,
    };
    (fan_in, FanInEvents { rx, active })
}

impl FanIn {
    /// Start watching a cluster
    ///
    /// Returns `false` without doing anything if the cluster is already being watched, so
    /// repeated announcements of the same cluster are harmless.
    pub fn add_cluster(&mut self, handle: ClusterHandle) -> bool {
        if self.clusters.contains_key(handle.id()) {
            tracing::debug!(cluster = %handle.id(), "cluster already watched");
            return false;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let cancel = self.cancel.child_token();
        let failing = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = JoinSet::new();
        for kind in &self.kinds {
            let subscription = Subscription {
                handle: handle.clone(),
                kind: kind.clone(),
                epoch,
                tx: self.tx.clone(),
                failing: failing.clone(),
                known: HashMap::new(),
            };
            tasks.spawn(subscription.run(cancel.clone()));
        }
        tracing::info!(cluster = %handle.id(), kinds = self.kinds.len(), "watching cluster");
        self.active.lock().insert(handle.id().clone(), epoch);
        self.clusters.insert(handle.id().clone(), Subscriptions {
            handle,
            cancel,
            tasks,
        });
        true
    }

    /// Stop watching a cluster
    ///
    /// No event from the cluster is delivered after this is called, even if it was already
    /// buffered. Returns `false` if the cluster was not being watched.
    pub async fn remove_cluster(&mut self, id: &ClusterId) -> bool {
        self.active.lock().remove(id);
        let Some(mut subscriptions) = self.clusters.remove(id) else {
            return false;
        };
        subscriptions.cancel.cancel();
        let drained = tokio::time::timeout(self.grace, async {
            while subscriptions.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(cluster = %id, grace = ?self.grace, "subscriptions did not stop in time, aborting");
            subscriptions.tasks.abort_all();
        }
        subscriptions.handle.set_state(ConnectionState::Disconnected);
        tracing::info!(cluster = %id, "stopped watching cluster");
        true
    }

    /// Whether the cluster is being watched
    #[must_use]
    pub fn contains(&self, id: &ClusterId) -> bool {
        self.clusters.contains_key(id)
    }

    /// Every cluster being watched
    #[must_use]
    pub fn clusters(&self) -> Vec<ClusterId> {
        self.clusters.keys().cloned().collect()
    }

    /// Stop watching every cluster
    pub async fn shutdown(&mut self) {
        for id in self.clusters() {
            self.remove_cluster(&id).await;
        }
    }
}

/// The merged event stream of a [`FanIn`]
///
/// Ends once the [`FanIn`] and all of its subscriptions are gone.
pub struct FanInEvents {
    rx: mpsc::Receiver<Tagged>,
    active: Active,
}

impl Stream for FanInEvents {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        loop {
            let Some(tagged) = ready!(self.rx.poll_recv(cx)) else {
                return Poll::Ready(None);
            };
            let current = self.active.lock().get(tagged.event.cluster()) == Some(&tagged.epoch);
            if current {
                return Poll::Ready(Some(tagged.event));
            }
            tracing::trace!(key = %tagged.event.key, "dropping event from a removed cluster");
        }
    }
}

/// The watch of one kind in one cluster
struct Subscription {
    handle: ClusterHandle,
    kind: String,
    epoch: u64,
    tx: mpsc::Sender<Tagged>,
    /// Kinds of this cluster whose watch is currently failing
    failing: Arc<Mutex<HashSet<String>>>,
    /// Resource version of every object forwarded so far
    known: HashMap<ObjectRef, Option<String>>,
}

impl Subscription {
    #[tracing::instrument(name = "subscription", skip_all, fields(cluster = %self.handle.id(), kind = %self.kind))]
    async fn run(mut self, cancel: CancellationToken) {
        let events = paced_watch(watcher(self.handle.client().clone(), self.kind.clone()))
            .skip_pause_for(watcher::Error::is_position_expired);
        pin_mut!(events);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = events.next() => next,
            };
            let changes = match next {
                Some(Ok(event)) => {
                    self.healthy(true);
                    self.translate(event)
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "watch failed, recovering");
                    self.healthy(false);
                    continue;
                }
                None => break,
            };
            for event in changes {
                tracing::trace!(key = %event.key, kind = ?event.kind, "forwarding change");
                let tagged = Tagged {
                    epoch: self.epoch,
                    event,
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    sent = self.tx.send(tagged) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        tracing::debug!("subscription stopped");
    }

    fn healthy(&self, healthy: bool) {
        let mut failing = self.failing.lock();
        if healthy {
            failing.remove(&self.kind);
        } else {
            failing.insert(self.kind.clone());
        }
        let state = if failing.is_empty() {
            ConnectionState::Connected
        } else {
            ConnectionState::Degraded
        };
        let previous = self.handle.set_state(state);
        if previous != state {
            tracing::info!(?state, "cluster connection changed");
        }
    }

    fn change(&self, kind: EventKind, obj: &DynamicObject) -> ChangeEvent {
        ChangeEvent::new(self.handle.id(), kind, obj)
    }

    /// Turn a watcher event into the changes not forwarded yet
    fn translate(&mut self, event: Event) -> Vec<ChangeEvent> {
        match event {
            Event::Applied(obj) => {
                let version = obj.metadata.resource_version.clone();
                match self.known.insert(obj.object_ref(), version.clone()) {
                    None => vec![self.change(EventKind::Added, &obj)],
                    Some(previous) if previous == version => Vec::new(),
                    Some(_) => vec![self.change(EventKind::Updated, &obj)],
                }
            }
            Event::Deleted(obj) => match self.known.remove(&obj.object_ref()) {
                Some(_) => vec![self.change(EventKind::Deleted, &obj)],
                None => Vec::new(),
            },
            Event::Restarted(objs) => {
                let mut previous = std::mem::take(&mut self.known);
                let mut changes = Vec::new();
                for obj in objs {
                    let obj_ref = obj.object_ref();
                    let version = obj.metadata.resource_version.clone();
                    if previous.remove(&obj_ref) != Some(version.clone()) {
                        changes.push(self.change(EventKind::Added, &obj));
                    }
                    self.known.insert(obj_ref, version);
                }
                for (obj_ref, _) in previous {
                    changes.push(ChangeEvent {
                        key: ResourceKey::new(self.handle.id().clone(), obj_ref),
                        kind: EventKind::Deleted,
                        observed_generation: None,
                    });
                }
                tracing::debug!(changes = changes.len(), known = self.known.len(), "resynced after re-list");
                changes
            }
        }
    }
}
