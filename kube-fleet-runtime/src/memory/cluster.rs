use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt};
use hashbrown::HashMap;
use kube_fleet_core::{
    ClusterClient, ClusterError, DynamicObject, ObjectList, ObjectRef, Position, Result, WatchEvent,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast::{self, error::RecvError};

/// How many changes a [`MemoryCluster`] retains for resuming watches by default
const DEFAULT_HISTORY: usize = 1024;

#[derive(Clone, Debug)]
struct Recorded {
    version: u64,
    kind: String,
    event: WatchEvent,
}

#[derive(Clone, Debug)]
enum Signal {
    Change(Recorded),
    /// Every open watch ends, as if the connection dropped
    Disconnect,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectRef, DynamicObject>,
    /// Version of the latest change
    version: u64,
    history: VecDeque<Recorded>,
    /// Changes up to and including this version are no longer retained
    compacted: u64,
    unreachable: bool,
}

impl State {
    fn reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(ClusterError::Unreachable("memory cluster is offline".into()));
        }
        Ok(())
    }
}

/// An in-process cluster
///
/// Behaves like a real cluster's resource API: every write gets a new, monotonically increasing
/// resource version, updates are compare-and-swap on that version, spec changes bump the
/// generation, and watches resume from a [`Position`] as long as the change is still retained in
/// the bounded history. [`MemoryCluster::compact`] drops the history so that older positions
/// expire, and [`MemoryCluster::set_unreachable`] simulates an outage.
pub struct MemoryCluster {
    state: Mutex<State>,
    signals: broadcast::Sender<Signal>,
    history_limit: usize,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// An empty cluster
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY)
    }

    /// An empty cluster retaining at most `limit` changes for resuming watches
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (signals, _) = broadcast::channel(DEFAULT_HISTORY.max(limit));
        Self {
            state: Mutex::new(State::default()),
            signals,
            history_limit: limit.max(1),
        }
    }

    /// Forget all retained history, so watches resuming from any earlier position must re-list
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.compacted = state.version;
        state.history.clear();
        tracing::debug!(version = state.version, "memory cluster compacted");
    }

    /// End every open watch, as if the connections had dropped
    pub fn disconnect_watches(&self) {
        let _ = self.signals.send(Signal::Disconnect);
    }

    /// Take the cluster offline (or bring it back)
    ///
    /// While offline every call fails with [`ClusterError::Unreachable`] and open watches end.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
        if unreachable {
            self.disconnect_watches();
        }
    }

    /// The version of the latest change
    #[must_use]
    pub fn position(&self) -> Position {
        Position::from(self.state.lock().version.to_string())
    }

    fn record(&self, state: &mut State, mut obj: DynamicObject, event: fn(DynamicObject) -> WatchEvent) -> DynamicObject {
        state.version += 1;
        obj.metadata.resource_version = Some(state.version.to_string());
        let recorded = Recorded {
            version: state.version,
            kind: obj.kind.clone(),
            event: event(obj.clone()),
        };
        state.history.push_back(recorded.clone());
        while state.history.len() > self.history_limit {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.version;
            }
        }
        let _ = self.signals.send(Signal::Change(recorded));
        obj
    }

    fn create_sync(&self, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.reachable()?;
        let key = obj.object_ref();
        if state.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("{key} already exists")));
        }
        obj.metadata.generation = Some(1);
        obj.metadata.uid = Some(format!("uid-{}", state.version + 1));
        let obj = self.record(&mut state, obj, WatchEvent::Added);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Replace an object, letting `merge` decide what the stored object becomes
    fn replace_sync(
        &self,
        obj: DynamicObject,
        merge: fn(&DynamicObject, DynamicObject) -> DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock();
        state.reachable()?;
        let key = obj.object_ref();
        let Some(current) = state.objects.get(&key) else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        if let Some(expected) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(ClusterError::Conflict(key.to_string()));
            }
        }
        let merged = merge(current, obj);
        let obj = self.record(&mut state, merged, WatchEvent::Modified);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    fn delete_sync(&self, obj_ref: &ObjectRef) -> Result<()> {
        let mut state = self.state.lock();
        state.reachable()?;
        let Some(obj) = state.objects.remove(obj_ref) else {
            return Err(ClusterError::NotFound(obj_ref.to_string()));
        };
        self.record(&mut state, obj, WatchEvent::Deleted);
        Ok(())
    }

    fn list_sync(&self, kind: &str) -> Result<ObjectList> {
        let state = self.state.lock();
        state.reachable()?;
        let mut items = state
            .objects
            .values()
            .filter(|obj| obj.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| {
            (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        Ok(ObjectList {
            items,
            position: Position::from(state.version.to_string()),
        })
    }

    fn watch_sync(&self, kind: &str, from: &Position) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let state = self.state.lock();
        state.reachable()?;
        let from = match from.as_str().parse::<u64>() {
            Ok(from) if from >= state.compacted => from,
            _ => return Err(ClusterError::PositionExpired(from.clone())),
        };
        let backlog = state
            .history
            .iter()
            .filter(|recorded| recorded.version > from && recorded.kind == kind)
            .map(|recorded| Ok(recorded.event.clone()))
            .collect::<Vec<_>>();
        // subscribing under the lock means no change falls between backlog and live events
        let signals = self.signals.subscribe();
        drop(state);

        let kind = kind.to_string();
        let live = stream::unfold(Some(signals), move |signals| {
            let kind = kind.clone();
            async move {
                let mut signals = signals?;
                loop {
                    match signals.recv().await {
                        Ok(Signal::Change(recorded)) if recorded.kind == kind => {
                            return Some((Ok(recorded.event), Some(signals)));
                        }
                        Ok(Signal::Change(_)) => {}
                        Ok(Signal::Disconnect) | Err(RecvError::Closed) => return None,
                        Err(RecvError::Lagged(missed)) => {
                            let err = ClusterError::Transient(format!("watch fell behind by {missed} changes"));
                            return Some((Err(err), None));
                        }
                    }
                }
            }
        });
        Ok(stream::iter(backlog).chain(live).boxed())
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, obj_ref: &ObjectRef) -> Result<Option<DynamicObject>> {
        let state = self.state.lock();
        state.reachable()?;
        Ok(state.objects.get(obj_ref).cloned())
    }

    async fn list(&self, kind: &str) -> Result<ObjectList> {
        self.list_sync(kind)
    }

    async fn watch(&self, kind: &str, from: &Position) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        self.watch_sync(kind, from)
    }

    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject> {
        self.create_sync(obj)
    }

    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject> {
        self.replace_sync(obj, |current, mut desired| {
            desired.status = current.status.clone();
            desired.metadata.uid = current.metadata.uid.clone();
            let generation = current.metadata.generation.unwrap_or(1);
            desired.metadata.generation = Some(if desired.spec == current.spec {
                generation
            } else {
                generation + 1
            });
            desired
        })
    }

    async fn update_status(&self, obj: DynamicObject) -> Result<DynamicObject> {
        self.replace_sync(obj, |current, desired| {
            let mut merged = current.clone();
            merged.status = desired.status;
            merged
        })
    }

    async fn delete(&self, obj_ref: &ObjectRef) -> Result<()> {
        self.delete_sync(obj_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryCluster;
    use futures::{poll, StreamExt};
    use kube_fleet_core::{ClusterClient, ClusterError, DynamicObject, Position, WatchEvent};
    use serde_json::json;

    #[tokio::test]
    async fn updates_are_compare_and_swap() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));

        let mut stale = created.clone();
        let updated = cluster.update(created.clone().spec(json!({"size": 2}))).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));
        stale.spec = json!({"size": 3});
        assert!(matches!(cluster.update(stale).await, Err(ClusterError::Conflict(_))));
    }

    #[tokio::test]
    async fn status_writes_keep_the_generation() {
        let cluster = MemoryCluster::new();
        let mut obj = cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
        obj.status = json!({"phase": "Ready"});
        obj.spec = json!({"ignored": true});
        let written = cluster.update_status(obj).await.unwrap();
        assert_eq!(written.metadata.generation, Some(1));
        assert_eq!(written.status, json!({"phase": "Ready"}));
        assert!(written.spec.is_null());
    }

    #[tokio::test]
    async fn watch_resumes_from_retained_history_only() {
        let cluster = MemoryCluster::with_history_limit(2);
        let start = cluster.position();
        for name in ["a", "b", "c"] {
            cluster.create(DynamicObject::new("Widget", name)).await.unwrap();
        }
        assert!(matches!(
            cluster.watch("Widget", &start).await,
            Err(ClusterError::PositionExpired(_))
        ));

        let mut events = cluster.watch("Widget", &Position::from("1")).await.unwrap();
        let names = [events.next().await, events.next().await].map(|ev| match ev {
            Some(Ok(WatchEvent::Added(obj))) => obj.metadata.name,
            other => panic!("unexpected {other:?}"),
        });
        assert_eq!(names, ["b", "c"]);
        assert!(poll!(events.next()).is_pending());
        cluster.disconnect_watches();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_every_call() {
        let cluster = MemoryCluster::new();
        cluster.set_unreachable(true);
        assert!(matches!(cluster.list("Widget").await, Err(ClusterError::Unreachable(_))));
        cluster.set_unreachable(false);
        assert!(cluster.list("Widget").await.unwrap().items.is_empty());
    }
}
