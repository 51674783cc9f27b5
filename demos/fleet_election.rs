use kube_fleet::{prelude::*, runtime::coordination::ConfigBuilder};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

async fn reconcile(req: Request, ctx: Context<String>) -> Result<Action, ReconcileError<std::io::Error>> {
    info!(instance = %ctx.get_ref(), key = %req.key, "reconciling");
    Ok(Action::requeue(Duration::from_secs(5)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cluster = Arc::new(MemoryCluster::new());
    for name in ["a", "b"] {
        cluster
            .create(DynamicObject::new("Widget", name).spec(json!({ "size": 1 })))
            .await?;
    }
    let leases = Arc::new(MemoryLeaseStore::new());

    let mut instances = Vec::new();
    for identity in ["blue", "green"] {
        let config = ConfigBuilder {
            lease_duration: Duration::from_secs(6),
            renew_interval: Duration::from_secs(4),
            retry_period: Duration::from_secs(1),
            api_timeout: Duration::from_secs(1),
            ..ConfigBuilder::new("demo-controller", identity)
        }
        .finish()?;
        let elector = LeaderElector::new(config, leases.clone());
        let mut state = elector.state();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                info!(%identity, state = ?current, "leadership changed");
            }
        });
        let controller = Controller::new(
            StaticProvider::new(vec![ClusterHandle::new("east", cluster.clone())]),
            reconciler_fn(reconcile, Context::new(identity.to_string())),
        )
        .watches("Widget")
        .leader_election(elector);
        let health = controller.health();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(shutdown.clone()));
        instances.push((identity, health, shutdown, task));
    }

    // stop the leader first, the standby takes over as soon as the lease is released
    tokio::time::sleep(Duration::from_secs(12)).await;
    instances.sort_by_key(|(_, health, ..)| !health.readiness());
    for (identity, health, shutdown, task) in instances {
        info!(%identity, leading = health.readiness(), "stopping instance");
        shutdown.cancel();
        task.await??;
        tokio::time::sleep(Duration::from_secs(8)).await;
    }
    Ok(())
}
