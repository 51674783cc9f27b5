//! Redundant controller instances competing for one lease
use kube_fleet_core::{ClusterClient, ClusterHandle, DynamicObject};
use kube_fleet_runtime::{
    controller::{reconciler_fn, Action, Context, Controller, ReconcileError, Request},
    coordination::{ConfigBuilder, LeaderElector, LeaseStore},
    membership::StaticProvider,
    memory::{MemoryCluster, MemoryLeaseStore},
    Health,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Identities of the instances that reconciled, in order
type Log = Mutex<Vec<String>>;

struct Instance {
    identity: &'static str,
    log: Arc<Log>,
}

async fn reconcile(_req: Request, ctx: Context<Instance>) -> Result<Action, ReconcileError<std::io::Error>> {
    let instance = ctx.get_ref();
    instance.log.lock().push(instance.identity.to_string());
    Ok(Action::await_change())
}

fn elector(identity: &str, leases: &Arc<MemoryLeaseStore>) -> LeaderElector {
    let config = ConfigBuilder {
        lease_duration: Duration::from_secs(5),
        renew_interval: Duration::from_secs(3),
        retry_period: Duration::from_secs(1),
        api_timeout: Duration::from_secs(1),
        ..ConfigBuilder::new("widget-controller", identity)
    };
    LeaderElector::new(config.finish().unwrap(), leases.clone())
}

struct Spawned {
    health: Health,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), kube_fleet_runtime::controller::Error>>,
}

fn spawn(identity: &'static str, cluster: &Arc<MemoryCluster>, leases: &Arc<MemoryLeaseStore>, log: &Arc<Log>) -> Spawned {
    let instance = Context::new(Instance {
        identity,
        log: log.clone(),
    });
    let controller = Controller::new(
        StaticProvider::new(vec![ClusterHandle::new("c1", cluster.clone())]),
        reconciler_fn(reconcile, instance),
    )
    .watches("Widget")
    .leader_election(elector(identity, leases));
    let health = controller.health();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(shutdown.clone()));
    Spawned { health, shutdown, task }
}

#[tokio::test(start_paused = true)]
async fn exactly_one_instance_reconciles_and_the_other_takes_over() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
    let leases = Arc::new(MemoryLeaseStore::new());
    let log = Arc::new(Log::default());

    let first = spawn("first", &cluster, &leases, &log);
    let second = spawn("second", &cluster, &leases, &log);
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !(first.health.readiness() && second.health.readiness()),
            "both instances believe they lead"
        );
    }
    let leader = log.lock().clone();
    assert_eq!(leader.len(), 1, "only the leader reconciles");
    let (leading, standby) = if leader[0] == "first" {
        (first, second)
    } else {
        (second, first)
    };
    assert!(leading.health.readiness());
    assert!(!standby.health.readiness());

    // a graceful shutdown releases the lease, so the standby does not wait for it to expire
    leading.shutdown.cancel();
    leading.task.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(standby.health.readiness());
    let lease = leases.get("widget-controller").await.unwrap().unwrap();
    assert_eq!(lease.record.fencing_token, 2);
    assert_eq!(lease.record.holder_identity.as_deref(), log.lock().last().map(String::as_str));
    assert_eq!(log.lock().len(), 2);

    standby.shutdown.cancel();
    standby.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn losing_the_lease_stops_reconciling() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
    let leases = Arc::new(MemoryLeaseStore::new());
    let log = Arc::new(Log::default());

    let only = spawn("only", &cluster, &leases, &log);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(only.health.readiness());
    assert_eq!(log.lock().len(), 1);

    // renewals fail, so the instance must step down and tear the pipeline down
    leases.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!only.health.readiness());
    cluster.create(DynamicObject::new("Widget", "b")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(log.lock().len(), 1);

    // once the store is back it leads again and starts over with a fresh list
    leases.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(only.health.readiness());
    assert_eq!(log.lock().len(), 3);

    only.shutdown.cancel();
    only.task.await.unwrap().unwrap();
}
