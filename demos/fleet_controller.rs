use futures::future;
use kube_fleet::{core::ClusterError, prelude::*};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Used when no config file is passed as the first argument
const DEFAULT_CONFIG: &str = r#"
workers: 4
kinds: [Widget]
leader_election:
  enabled: false
membership:
  resync_period_secs: 10
"#;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("failed to write to cluster: {0}")]
    Write(#[from] ClusterError),
}

fn gadget_ref(widget: &ObjectRef) -> ObjectRef {
    let gadget = ObjectRef::new("Gadget", &widget.name);
    match &widget.namespace {
        Some(ns) => gadget.within(ns),
        None => gadget,
    }
}

/// Make sure a gadget with the widget's spec exists
async fn ensure_gadget(client: &Arc<dyn ClusterClient>, widget: &DynamicObject) -> Result<(), Error> {
    let gadget_ref = gadget_ref(&widget.object_ref());
    match client.get(&gadget_ref).await? {
        Some(gadget) if gadget.spec == widget.spec => {}
        Some(gadget) => {
            client.update(gadget.spec(widget.spec.clone())).await?;
        }
        None => {
            let mut gadget = DynamicObject::new("Gadget", &gadget_ref.name).spec(widget.spec.clone());
            gadget.metadata.namespace = gadget_ref.namespace.clone();
            client.create(gadget).await?;
        }
    }
    Ok(())
}

/// Keeps a `Gadget` with the same spec next to every `Widget`, and reports progress in the widget's status
async fn reconcile(req: Request, _ctx: Context<()>) -> Result<Action, ReconcileError<Error>> {
    let client = req.cluster.client();
    let Some(widget) = req.object else {
        info!(key = %req.key, "widget is gone, removing its gadget");
        return match client.delete(&gadget_ref(&req.key.object)).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(Action::await_change()),
            Err(err) => Err(Error::from(err).into()),
        };
    };
    let size = widget.spec["size"].as_i64().unwrap_or(1);
    if size < 0 {
        return Err(ReconcileError::terminal("InvalidSize", format!("size {size} is negative")));
    }
    ensure_gadget(client, &widget).await?;

    if widget.status.get("observedSize") != Some(&json!(size)) {
        let mut updated = widget.clone();
        updated.status = json!({ "observedSize": size });
        client.update_status(updated).await.map_err(Error::from)?;
        info!(key = %req.key, size, "widget reconciled");
    }
    // check on the gadget every now and then in case someone edits it
    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Changes the fleet and its objects while the controller runs
async fn simulate(membership: Arc<MemoryMembership>, east: Arc<MemoryCluster>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let steps = async {
        for (i, size) in [3, 5, -1, 7].into_iter().enumerate() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let name = format!("widget-{}", i % 2);
            let widget = DynamicObject::new("Widget", &name).spec(json!({ "size": size }));
            match east.get(&widget.object_ref()).await? {
                Some(current) => east.update(current.spec(widget.spec)).await?,
                None => east.create(widget).await?,
            };
            info!(%name, size, "changed widget");
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let south = Arc::new(MemoryCluster::new());
        south.create(DynamicObject::new("Widget", "far-away").spec(json!({ "size": 1 }))).await?;
        membership.add(ClusterHandle::new("south", south));
        info!("south joined the fleet");

        tokio::time::sleep(Duration::from_secs(4)).await;
        membership.remove(&ClusterId::from("south"));
        info!("south left the fleet");
        anyhow::Ok(())
    };
    tokio::select! {
        res = steps => res,
        () = shutdown.cancelled() => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kube_fleet_runtime=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ControllerConfig::from_yaml_file(path)?,
        None => ControllerConfig::from_yaml_str(DEFAULT_CONFIG)?,
    };

    let membership = Arc::new(MemoryMembership::new());
    let east = Arc::new(MemoryCluster::new());
    let west = Arc::new(MemoryCluster::new());
    west.create(DynamicObject::new("Widget", "resident").spec(json!({ "size": 2 })))
        .await?;
    membership.add(ClusterHandle::new("east", east.clone()));
    membership.add(ClusterHandle::new("west", west));

    let provider = DiscoveryProvider::from_arc(membership.clone());
    let controller = Controller::from_config(
        &config,
        provider,
        reconciler_fn(reconcile, Context::new(())),
        Arc::new(MemoryLeaseStore::new()),
    )?;
    let health = controller.health();

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        }
    };
    let report = {
        let shutdown = shutdown.clone();
        async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(5));
            while !shutdown.is_cancelled() {
                tokio::select! {
                    _ = ticks.tick() => info!(health = %serde_json::to_string(&health.report()).unwrap_or_default(), "health"),
                    () = shutdown.cancelled() => {}
                }
            }
        }
    };
    tokio::spawn(ctrl_c);
    tokio::spawn(report);
    let simulation = tokio::spawn(simulate(membership, east, shutdown.clone()));

    info!("press <ctrl+c> to stop");
    let (ran, simulated) = future::join(controller.run(shutdown.clone()), simulation).await;
    ran?;
    simulated??;
    Ok(())
}
