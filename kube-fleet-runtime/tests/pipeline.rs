//! End to end behaviour of the controller pipeline against in-memory clusters
use kube_fleet_core::{ClusterClient, ClusterHandle, ClusterId, DynamicObject, ObjectRef};
use kube_fleet_runtime::{
    controller::{reconciler_fn, Action, Context, Controller, ReconcileError, Request},
    membership::{DiscoveryProvider, StaticProvider},
    memory::{MemoryCluster, MemoryMembership},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

/// What the reconciler saw, per object name
#[derive(Default)]
struct Journal {
    calls: Mutex<BTreeMap<String, Vec<(Value, u32, Instant)>>>,
    blocker: Notify,
    entered: Notify,
}

impl Journal {
    fn calls(&self, name: &str) -> usize {
        self.calls.lock().get(name).map_or(0, Vec::len)
    }

    fn specs(&self, name: &str) -> Vec<Value> {
        self.calls
            .lock()
            .get(name)
            .map(|calls| calls.iter().map(|(spec, ..)| spec.clone()).collect())
            .unwrap_or_default()
    }

    fn record(&self, req: &Request) {
        let spec = req.object.as_ref().map_or(Value::Null, |obj| obj.spec.clone());
        self.calls
            .lock()
            .entry(req.key.object.name.clone())
            .or_default()
            .push((spec, req.attempts, Instant::now()));
    }
}

#[derive(Debug, thiserror::Error)]
#[error("flaky backend")]
struct Flaky;

/// Behaviour is chosen by the object's spec, so one reconciler serves every scenario
async fn reconcile(req: Request, ctx: Context<Journal>) -> Result<Action, ReconcileError<Flaky>> {
    let journal = ctx.get_ref();
    journal.record(&req);
    let spec = req.object.as_ref().map_or(Value::Null, |obj| obj.spec.clone());
    if spec["block"].as_bool() == Some(true) {
        journal.entered.notify_one();
        journal.blocker.notified().await;
    }
    if let Some(fail_times) = spec["failTimes"].as_u64() {
        if u64::from(req.attempts) < fail_times {
            return Err(Flaky.into());
        }
    }
    if spec["size"].as_i64().is_some_and(|size| size < 0) {
        return Err(ReconcileError::terminal("InvalidSize", "size may not be negative"));
    }
    match spec["pollSecs"].as_u64() {
        Some(secs) => Ok(Action::requeue(Duration::from_secs(secs))),
        None => Ok(Action::await_change()),
    }
}

fn widget(name: &str, spec: Value) -> DynamicObject {
    DynamicObject::new("Widget", name).spec(spec)
}

fn widget_ref(name: &str) -> ObjectRef {
    ObjectRef::new("Widget", name)
}

async fn respec(cluster: &MemoryCluster, name: &str, spec: Value) {
    let current = cluster.get(&widget_ref(name)).await.unwrap().unwrap();
    cluster.update(current.spec(spec)).await.unwrap();
}

struct Running {
    journal: Context<Journal>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), kube_fleet_runtime::controller::Error>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn start(provider: impl kube_fleet_runtime::membership::Provider, workers: usize) -> Running {
    let journal = Context::new(Journal::default());
    let controller = Controller::new(provider, reconciler_fn(reconcile, journal.clone()))
        .watches("Widget")
        .workers(workers);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(shutdown.clone()));
    Running {
        journal,
        shutdown,
        task,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn burst_of_changes_is_reconciled_once_with_the_latest_state() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(widget("blocker", json!({"block": true}))).await.unwrap();
    let running = start(StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]), 1);
    let journal = running.journal.get_ref();

    // keep the only worker busy while the burst arrives
    journal.entered.notified().await;
    cluster.create(widget("a", json!({"size": 1}))).await.unwrap();
    respec(&cluster, "a", json!({"size": 2})).await;
    respec(&cluster, "a", json!({"size": 3})).await;
    settle().await;
    assert_eq!(journal.calls("a"), 0);

    journal.blocker.notify_one();
    settle().await;
    assert_eq!(journal.specs("a"), vec![json!({"size": 3})]);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn requeue_is_not_processed_early() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(widget("poller", json!({"pollSecs": 30}))).await.unwrap();
    let running = start(StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]), 2);
    let journal = running.journal.get_ref();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(journal.calls("poller"), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(journal.calls("poller"), 2);

    let times: Vec<Instant> = journal.calls.lock()["poller"].iter().map(|(.., at)| *at).collect();
    assert!(times[1] - times[0] >= Duration::from_secs(30));
    running.stop().await;
}

#[tokio::test]
async fn relist_after_expired_position_only_reconciles_what_changed() {
    let cluster = Arc::new(MemoryCluster::new());
    for name in ["a", "b", "c"] {
        cluster.create(widget(name, json!({"size": 1}))).await.unwrap();
    }
    let running = start(StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]), 2);
    let journal = running.journal.get_ref();
    settle().await;
    for name in ["a", "b", "c"] {
        assert_eq!(journal.calls(name), 1);
    }

    cluster.disconnect_watches();
    respec(&cluster, "b", json!({"size": 2})).await;
    cluster.compact();
    settle().await;
    assert_eq!(journal.calls("a"), 1);
    assert_eq!(journal.specs("b"), vec![json!({"size": 1}), json!({"size": 2})]);
    assert_eq!(journal.calls("c"), 1);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_back_off_and_count_attempts() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(widget("flaky", json!({"failTimes": 2}))).await.unwrap();
    let running = start(StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]), 1);
    let journal = running.journal.get_ref();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let attempts: Vec<u32> = journal.calls.lock()["flaky"].iter().map(|(_, attempts, _)| *attempts).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    running.stop().await;
}

#[tokio::test]
async fn terminal_failures_are_recorded_until_the_spec_changes() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(widget("bad", json!({"size": -1}))).await.unwrap();
    let running = start(StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]), 1);
    let journal = running.journal.get_ref();
    settle().await;

    let obj = cluster.get(&widget_ref("bad")).await.unwrap().unwrap();
    let condition = obj.condition("Reconciled").unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, "InvalidSize");
    assert_eq!(condition.observed_generation, obj.metadata.generation);
    // writing the condition is itself a change, which must not lead to another attempt
    assert_eq!(journal.calls("bad"), 1);

    respec(&cluster, "bad", json!({"size": 1})).await;
    settle().await;
    let obj = cluster.get(&widget_ref("bad")).await.unwrap().unwrap();
    assert_eq!(obj.condition("Reconciled").unwrap().status, "True");
    assert!(journal.specs("bad").contains(&json!({"size": 1})));
    running.stop().await;
}

#[tokio::test]
async fn removed_cluster_cancels_its_work() {
    let source = Arc::new(MemoryMembership::new());
    let c1 = Arc::new(MemoryCluster::new());
    let c2 = Arc::new(MemoryCluster::new());
    c1.create(widget("stuck", json!({"block": true}))).await.unwrap();
    source.add(ClusterHandle::new("c1", c1.clone()));
    source.add(ClusterHandle::new("c2", c2.clone()));

    let journal = Context::new(Journal::default());
    let controller = Controller::new(
        DiscoveryProvider::from_arc(source.clone()),
        reconciler_fn(reconcile, journal.clone()),
    )
    .watches("Widget")
    .workers(2)
    .shutdown_grace(Duration::from_millis(500));
    let health = controller.health();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(shutdown.clone()));

    journal.get_ref().entered.notified().await;
    assert_eq!(health.report().in_flight, Some(1));
    source.remove(&ClusterId::from("c1"));
    settle().await;
    let report = health.report();
    assert_eq!(report.in_flight, Some(0));
    assert_eq!(report.queue_depth, Some(0));

    c1.create(widget("late", json!({}))).await.unwrap();
    c2.create(widget("other", json!({}))).await.unwrap();
    settle().await;
    assert_eq!(journal.get_ref().calls("late"), 0);
    assert_eq!(journal.get_ref().calls("other"), 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}
