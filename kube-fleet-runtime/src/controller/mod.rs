//! Runs reconcilers for every object of the watched kinds across the whole fleet
//!
//! A [`Controller`] wires the other runtime components into one pipeline:
//!
//! - the membership [`Provider`] announces clusters joining and leaving the fleet,
//! - the [`fan_in`] subscribes to every watched kind in every cluster,
//! - every change enqueues its [`ResourceKey`](kube_fleet_core::ResourceKey) on a [`WorkQueue`],
//! - a fixed pool of workers drains the queue and calls the [`Reconciler`].
//!
//! When leader election is configured the pipeline only runs while this instance holds the
//! lease, and is torn down the moment a renewal fails.
use crate::{
    config::ControllerConfig,
    coordination::{self, LeaderElector, LeaderState, LeaseStore},
    fanin::fan_in,
    health::Health,
    membership::{self, MembershipEvent, Provider},
    queue::WorkQueue,
    utils::ItemBackoff,
};
use futures::{pin_mut, Future, StreamExt};
use hashbrown::HashMap;
use kube_fleet_core::{ClusterHandle, ClusterId};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

mod reconciler;
mod worker;

pub use reconciler::{reconciler_fn, Action, Context, ReconcileError, Reconciler, ReconcilerFn, Request};

/// How often the run loop reports that it is alive
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Errors that stop a [`Controller`]
#[derive(Debug, Error)]
pub enum Error {
    /// Membership discovery failed in a way that cannot be retried
    #[error("membership discovery failed: {0}")]
    Membership(#[from] membership::Error),
    /// The membership provider stopped without being asked to
    #[error("membership stream ended unexpectedly")]
    MembershipEnded,
    /// The controller was configured in a way that cannot run
    #[error("invalid controller configuration: {0}")]
    Config(String),
    /// Leader election could not be set up
    #[error("leader election failed: {0}")]
    LeaderElection(#[from] coordination::Error),
}

/// Convient alias for controller results
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The clusters currently in the fleet, shared between the pipeline and its workers
#[derive(Clone, Default)]
pub(crate) struct Clusters(Arc<RwLock<HashMap<ClusterId, ClusterHandle>>>);

impl Clusters {
    pub(crate) fn insert(&self, handle: ClusterHandle) {
        self.0.write().insert(handle.id().clone(), handle);
    }

    pub(crate) fn remove(&self, id: &ClusterId) -> Option<ClusterHandle> {
        self.0.write().remove(id)
    }

    pub(crate) fn get(&self, id: &ClusterId) -> Option<ClusterHandle> {
        self.0.read().get(id).cloned()
    }
}

/// A multi-cluster controller
///
/// ```no_run
/// use kube_fleet_core::ClusterHandle;
/// use kube_fleet_runtime::{
///     controller::{reconciler_fn, Action, Context, Controller, ReconcileError, Request},
///     memory::MemoryCluster,
///     membership::StaticProvider,
/// };
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn reconcile(req: Request, _ctx: Context<()>) -> Result<Action, ReconcileError<std::io::Error>> {
///     println!("reconciling {}", req.key);
///     Ok(Action::await_change())
/// }
///
/// # async fn doc() -> Result<(), kube_fleet_runtime::controller::Error> {
/// let provider = StaticProvider::new(vec![ClusterHandle::new("east", Arc::new(MemoryCluster::new()))]);
/// Controller::new(provider, reconciler_fn(reconcile, Context::new(())))
///     .watches("Widget")
///     .workers(8)
///     .run(CancellationToken::new())
///     .await
/// # }
/// ```
pub struct Controller<R: Reconciler> {
    provider: Arc<dyn Provider>,
    reconciler: Arc<R>,
    kinds: Vec<String>,
    workers: usize,
    queue_backoff: ItemBackoff,
    shutdown_grace: Duration,
    elector: Option<LeaderElector>,
    health: Health,
}

impl<R: Reconciler> Controller<R> {
    /// Create a controller that reconciles with `reconciler` across the clusters `provider` finds
    ///
    /// Nothing is watched until at least one kind is added with [`Controller::watches`].
    #[must_use]
    pub fn new(provider: impl Provider, reconciler: R) -> Self {
        Self {
            provider: Arc::new(provider),
            reconciler: Arc::new(reconciler),
            kinds: Vec::new(),
            workers: 4,
            queue_backoff: ItemBackoff::default(),
            shutdown_grace: Duration::from_secs(5),
            elector: None,
            health: Health::default(),
        }
    }

    /// Build a controller from loaded configuration
    ///
    /// Leader election competes through `leases` when enabled in `config`.
    ///
    /// # Errors
    /// Fails if `config` does not validate.
    pub fn from_config(
        config: &ControllerConfig,
        provider: impl Provider,
        reconciler: R,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        config.validate().map_err(|err| Error::Config(err.to_string()))?;
        let mut controller = Self::new(provider, reconciler)
            .workers(config.workers)
            .queue_backoff(config.queue.backoff())
            .shutdown_grace(config.shutdown_grace())
            .with_health(config.health());
        for kind in &config.kinds {
            controller = controller.watches(kind.clone());
        }
        if config.leader_election.enabled {
            let elector = LeaderElector::new(config.leader_election.builder().finish()?, leases);
            controller = controller.leader_election(elector);
        }
        Ok(controller)
    }

    /// Watch (and reconcile) objects of `kind` in every cluster
    #[must_use]
    pub fn watches(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    /// Number of concurrent reconciles
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Backoff applied to keys whose reconcile failed
    #[must_use]
    pub fn queue_backoff(mut self, backoff: ItemBackoff) -> Self {
        self.queue_backoff = backoff;
        self
    }

    /// Only run while `elector` holds its lease
    #[must_use]
    pub fn leader_election(mut self, elector: LeaderElector) -> Self {
        self.elector = Some(elector);
        self
    }

    /// How long tasks get to finish when a cluster leaves or the pipeline stops
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Report health through `health` rather than a private tracker
    #[must_use]
    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    /// The health of this controller, for liveness and readiness probes
    #[must_use]
    pub fn health(&self) -> Health {
        self.health.clone()
    }

    /// Run until `shutdown` fires or a fatal error occurs
    ///
    /// Without leader election the pipeline starts right away. With it, the pipeline runs for as
    /// long as the lease is held and restarts from scratch every time leadership is regained.
    ///
    /// # Errors
    /// Fails on invalid configuration and on fatal membership errors. Losing the lease is not an
    /// error, the controller goes back to competing for it.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_terms(shutdown).await;
        self.health.stopped();
        result
    }

    async fn run_terms(&mut self, shutdown: CancellationToken) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(Error::Config("no resource kinds to watch".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("at least one worker is required".into()));
        }

        let Some(mut elector) = self.elector.take() else {
            self.health.set_leader_state(LeaderState::Leading { fencing_token: 0 });
            let result = self.pipeline(shutdown).await;
            self.health.set_leader_state(LeaderState::Standby);
            return result;
        };

        loop {
            self.health.set_leader_state(LeaderState::Acquiring);
            let Some(fencing_token) = self.alive_while(elector.acquire(&shutdown)).await else {
                self.health.set_leader_state(LeaderState::Standby);
                return Ok(());
            };
            self.health.set_leader_state(LeaderState::Leading { fencing_token });
            tracing::info!(identity = elector.identity(), fencing_token, "leading, starting pipeline");

            let term = shutdown.child_token();
            let pipeline = self.pipeline(term.clone());
            pin_mut!(pipeline);
            tokio::select! {
                result = &mut pipeline => {
                    self.alive_while(elector.release()).await;
                    self.health.set_leader_state(LeaderState::Standby);
                    return result;
                }
                held = elector.hold(&term) => {
                    term.cancel();
                    let result = pipeline.await;
                    self.health.set_leader_state(LeaderState::Standby);
                    match held {
                        Ok(()) => {
                            self.alive_while(elector.release()).await;
                            return result;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "lost leadership, pipeline stopped");
                            result?;
                        }
                    }
                }
            }
        }
    }

    /// Drive `fut` while heartbeating, so a standby instance stays live while it waits for the lease
    async fn alive_while<F: Future>(&self, fut: F) -> F::Output {
        pin_mut!(fut);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = heartbeat.tick() => self.health.heartbeat(),
            }
        }
    }

    /// Run the pipeline until `cancel` fires or membership fails
    #[tracing::instrument(skip_all)]
    async fn pipeline(&self, cancel: CancellationToken) -> Result<()> {
        let queue = WorkQueue::new(self.queue_backoff);
        self.health.attach_queue(queue.clone());
        let clusters = Clusters::default();
        let (mut fan_in, mut changes) = fan_in(self.kinds.clone(), cancel.child_token(), self.shutdown_grace);
        let mut membership = self
            .provider
            .start(self.health.discovery_probe(), cancel.child_token());

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let worker = worker::Worker {
                id,
                queue: queue.clone(),
                clusters: clusters.clone(),
                reconciler: self.reconciler.clone(),
            };
            workers.spawn(worker.run());
        }
        tracing::info!(workers = self.workers, kinds = ?self.kinds, "pipeline started");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                event = membership.next() => match event {
                    Some(Ok(MembershipEvent::ClusterAdded(handle))) => {
                        if fan_in.add_cluster(handle.clone()) {
                            clusters.insert(handle);
                        }
                    }
                    Some(Ok(MembershipEvent::ClusterRemoved(id))) => {
                        clusters.remove(&id);
                        let dropped = queue.forget_cluster(&id);
                        fan_in.remove_cluster(&id).await;
                        tracing::info!(cluster = %id, dropped, "cluster left the fleet");
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "membership failed, stopping pipeline");
                        break Err(Error::Membership(err));
                    }
                    None if cancel.is_cancelled() => break Ok(()),
                    None => break Err(Error::MembershipEnded),
                },
                Some(change) = changes.next() => {
                    tracing::trace!(key = %change.key, kind = ?change.kind, "change observed");
                    queue.add(change.key);
                }
                _ = heartbeat.tick() => self.health.heartbeat(),
            }
        };

        queue.shutdown();
        fan_in.shutdown().await;
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "worker failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(grace = ?self.shutdown_grace, "workers did not stop in time, aborting");
            workers.abort_all();
        }
        self.health.detach_queue();
        tracing::info!("pipeline stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{reconciler_fn, Action, Context, Controller, Error, ReconcileError, Request};
    use crate::{
        coordination::{ConfigBuilder, LeaderElector},
        membership::{DiscoveryProvider, MembershipEvent, Provider, StaticProvider},
        memory::{MemoryCluster, MemoryLeaseStore, MemoryMembership},
        health::DiscoveryProbe,
    };
    use futures::{stream, stream::BoxStream, StreamExt};
    use kube_fleet_core::{ClusterClient, ClusterHandle, ClusterId, DynamicObject, ResourceKey};
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};
    use tokio_util::sync::CancellationToken;

    type Seen = Mutex<Vec<ResourceKey>>;

    async fn record(req: Request, ctx: Context<Seen>) -> Result<Action, ReconcileError<std::io::Error>> {
        ctx.get_ref().lock().push(req.key);
        Ok(Action::await_change())
    }

    fn seen(ctx: &Context<Seen>) -> Vec<String> {
        let mut keys: Vec<String> = ctx.get_ref().lock().iter().map(ToString::to_string).collect();
        keys.sort();
        keys
    }

    async fn widget(cluster: &MemoryCluster, name: &str) {
        cluster.create(DynamicObject::new("Widget", name)).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unrunnable_configuration() {
        let ctx = Context::new(Seen::default());
        let controller = Controller::new(StaticProvider::default(), reconciler_fn(record, ctx.clone()));
        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let controller = Controller::new(StaticProvider::default(), reconciler_fn(record, ctx))
            .watches("Widget")
            .workers(0);
        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn reconciles_objects_of_every_cluster() {
        let east = Arc::new(MemoryCluster::new());
        let west = Arc::new(MemoryCluster::new());
        widget(&east, "a").await;
        widget(&west, "b").await;
        let provider = StaticProvider::new(vec![
            ClusterHandle::new("east", east.clone()),
            ClusterHandle::new("west", west.clone()),
        ]);
        let ctx = Context::new(Seen::default());
        let controller = Controller::new(provider, reconciler_fn(record, ctx.clone())).watches("Widget");
        let health = controller.health();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(controller.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen(&ctx), vec!["east:Widget/a", "west:Widget/b"]);
        assert!(health.liveness());
        assert!(health.readiness());

        widget(&west, "c").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen(&ctx), vec!["east:Widget/a", "west:Widget/b", "west:Widget/c"]);

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert!(!health.liveness());
        assert!(!health.readiness());
    }

    #[tokio::test]
    async fn removed_clusters_are_no_longer_reconciled() {
        let source = Arc::new(MemoryMembership::new());
        let east = Arc::new(MemoryCluster::new());
        source.add(ClusterHandle::new("east", east.clone()));
        let ctx = Context::new(Seen::default());
        let controller = Controller::new(DiscoveryProvider::from_arc(source.clone()), reconciler_fn(record, ctx.clone()))
            .watches("Widget");
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(controller.run(shutdown.clone()));

        widget(&east, "a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen(&ctx), vec!["east:Widget/a"]);

        source.remove(&ClusterId::from("east"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        widget(&east, "b").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen(&ctx), vec!["east:Widget/a"]);

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    struct Broken;

    impl Provider for Broken {
        fn start(&self, _probe: DiscoveryProbe, _cancel: CancellationToken) -> BoxStream<'static, crate::membership::Result<MembershipEvent>> {
            stream::iter([Err(crate::membership::Error::Fatal("no clusters configured".into()))]).boxed()
        }
    }

    #[tokio::test]
    async fn fatal_membership_errors_stop_the_controller() {
        let ctx = Context::new(Seen::default());
        let controller = Controller::new(Broken, reconciler_fn(record, ctx)).watches("Widget");
        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Membership(_)));
    }

    #[tokio::test]
    async fn only_runs_while_leading() {
        let cluster = Arc::new(MemoryCluster::new());
        widget(&cluster, "a").await;
        let leases = Arc::new(MemoryLeaseStore::new());
        let ctx = Context::new(Seen::default());
        let elector = LeaderElector::new(
            ConfigBuilder::new("fleet", "instance-1").finish().unwrap(),
            leases.clone(),
        );
        let controller = Controller::new(
            StaticProvider::new(vec![ClusterHandle::new("east", cluster.clone())]),
            reconciler_fn(record, ctx.clone()),
        )
        .watches("Widget")
        .leader_election(elector);
        let health = controller.health();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(controller.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen(&ctx), vec!["east:Widget/a"]);
        assert!(health.report().leader.is_some_and(|state| state.is_leader()));

        shutdown.cancel();
        running.await.unwrap().unwrap();
        assert!(!health.readiness());
        // released on the way out
        let lease = crate::coordination::LeaseStore::get(leases.as_ref(), "fleet").await.unwrap().unwrap();
        assert_eq!(lease.record.holder_identity, None);
    }

    #[tokio::test(start_paused = true)]
    async fn standby_instance_is_live_but_not_ready() {
        let cluster = Arc::new(MemoryCluster::new());
        let leases = Arc::new(MemoryLeaseStore::new());
        let shutdown = CancellationToken::new();
        let mut instances = Vec::new();
        for identity in ["instance-1", "instance-2"] {
            let elector = LeaderElector::new(ConfigBuilder::new("fleet", identity).finish().unwrap(), leases.clone());
            let controller = Controller::new(
                StaticProvider::new(vec![ClusterHandle::new("east", cluster.clone())]),
                reconciler_fn(record, Context::new(Seen::default())),
            )
            .watches("Widget")
            .leader_election(elector);
            let health = controller.health();
            instances.push((health, tokio::spawn(controller.run(shutdown.clone()))));
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(instances.iter().all(|(health, _)| health.liveness()));
        let ready = instances.iter().filter(|(health, _)| health.readiness()).count();
        assert_eq!(ready, 1);

        shutdown.cancel();
        for (health, running) in instances {
            running.await.unwrap().unwrap();
            assert!(!health.liveness());
        }
    }
}
