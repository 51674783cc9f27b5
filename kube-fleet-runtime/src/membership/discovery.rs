use super::{Error, MembershipEvent, Provider, Result};
use crate::{health::DiscoveryProbe, utils::FullJitterBackoff};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures::{stream, stream::BoxStream, StreamExt};
use hashbrown::HashMap;
use kube_fleet_core::{ClusterHandle, ClusterId};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors reported by a [`MembershipSource`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source is temporarily unavailable, discovery will be retried
    #[error("membership source unavailable: {0}")]
    Unavailable(String),
    /// The source is misconfigured, retrying cannot help
    #[error("membership source misconfigured: {0}")]
    Invalid(String),
}

/// An incremental change reported by a [`MembershipSource`] subscription
#[derive(Clone, Debug)]
pub enum SourceEvent {
    /// A cluster appeared
    Added(ClusterHandle),
    /// A cluster disappeared
    Removed(ClusterId),
}

/// A backend that knows which clusters exist, such as a discovery service
#[async_trait]
pub trait MembershipSource: Send + Sync + 'static {
    /// Every cluster that currently exists
    async fn list_clusters(&self) -> Result<Vec<ClusterHandle>, SourceError>;

    /// Subscribe to changes that happen from now on
    ///
    /// The subscription may end at any time, after which the provider re-lists and subscribes again.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<SourceEvent, SourceError>>, SourceError>;
}

/// A dynamic fleet backed by a [`MembershipSource`]
///
/// Subscribes for changes, lists the current clusters and then applies changes incrementally.
/// Every time the subscription breaks (and every `resync_period`) the full list is fetched again and
/// diffed against what was announced, so removals that happened while disconnected are not lost.
/// Transient failures are retried with full-jitter exponential backoff, only
/// [`SourceError::Invalid`] ends the stream.
pub struct DiscoveryProvider<S> {
    source: Arc<S>,
    base_backoff: Duration,
    max_backoff: Duration,
    resync_period: Duration,
}

impl<S: MembershipSource> DiscoveryProvider<S> {
    /// Discover clusters from `source` with the default backoff (1s to 30s) and a 30s resync
    #[must_use]
    pub fn new(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }

    /// Like [`DiscoveryProvider::new`], sharing an existing source
    #[must_use]
    pub fn from_arc(source: Arc<S>) -> Self {
        Self {
            source,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            resync_period: Duration::from_secs(30),
        }
    }

    /// Override the retry backoff bounds
    #[must_use]
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Override how often the full list is fetched while the subscription is healthy
    #[must_use]
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }
}

impl<S: MembershipSource> Provider for DiscoveryProvider<S> {
    fn start(&self, probe: DiscoveryProbe, cancel: CancellationToken) -> BoxStream<'static, Result<MembershipEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let discovery = Discovery {
            source: self.source.clone(),
            known: HashMap::new(),
            tx,
            probe,
            backoff: FullJitterBackoff::new(self.base_backoff, self.max_backoff),
            resync_period: self.resync_period,
        };
        tokio::spawn(discovery.run(cancel));
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }
}

/// Why a discovery loop iteration ended
enum Interrupted {
    /// A transient failure was backed off, start over
    Retry,
    Cancelled,
    /// The consumer went away
    Closed,
    Fatal(String),
}

struct Discovery<S> {
    source: Arc<S>,
    /// Every cluster announced and not yet removed
    known: HashMap<ClusterId, ClusterHandle>,
    tx: mpsc::UnboundedSender<Result<MembershipEvent>>,
    probe: DiscoveryProbe,
    backoff: FullJitterBackoff,
    resync_period: Duration,
}

impl<S: MembershipSource> Discovery<S> {
    #[tracing::instrument(name = "membership_discovery", skip_all)]
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.watch_once(&cancel).await {
                Interrupted::Retry => continue,
                Interrupted::Cancelled | Interrupted::Closed => break,
                Interrupted::Fatal(reason) => {
                    tracing::error!(%reason, "membership discovery failed permanently");
                    let _ = self.tx.send(Err(Error::Fatal(reason)));
                    break;
                }
            }
        }
        tracing::debug!("membership discovery stopped");
    }

    /// Subscribe, list and follow the subscription until it breaks
    ///
    /// Transient failures are backed off here, so the caller can simply start over.
    async fn watch_once(&mut self, cancel: &CancellationToken) -> Interrupted {
        let subscribed = tokio::select! {
            () = cancel.cancelled() => return Interrupted::Cancelled,
            res = self.source.subscribe() => res,
        };
        let mut changes = match subscribed {
            Ok(changes) => changes,
            Err(err) => return self.back_off(err, cancel).await,
        };
        if let Err(interrupted) = self.resync(cancel).await {
            return interrupted;
        }
        self.backoff.reset();

        let mut resync = tokio::time::interval(self.resync_period);
        resync.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Interrupted::Cancelled,
                _ = resync.tick() => {
                    if let Err(interrupted) = self.resync(cancel).await {
                        return interrupted;
                    }
                }
                change = changes.next() => match change {
                    Some(Ok(SourceEvent::Added(handle))) => {
                        self.probe.succeeded();
                        if let Err(interrupted) = self.announce(handle) {
                            return interrupted;
                        }
                    }
                    Some(Ok(SourceEvent::Removed(id))) => {
                        self.probe.succeeded();
                        if let Err(interrupted) = self.retract(&id) {
                            return interrupted;
                        }
                    }
                    Some(Err(err)) => return self.back_off(err, cancel).await,
                    None => {
                        tracing::debug!("membership subscription ended, re-listing");
                        return self.back_off(SourceError::Unavailable("subscription closed".into()), cancel).await;
                    }
                },
            }
        }
    }

    /// Fetch the full list and announce the difference to what is already known
    ///
    /// A transient list failure is backed off before returning.
    async fn resync(&mut self, cancel: &CancellationToken) -> Result<(), Interrupted> {
        let listed = tokio::select! {
            () = cancel.cancelled() => return Err(Interrupted::Cancelled),
            res = self.source.list_clusters() => res,
        };
        let listed = match listed {
            Ok(listed) => listed,
            Err(err) => return Err(self.back_off(err, cancel).await),
        };
        let gone = self
            .known
            .keys()
            .filter(|id| !listed.iter().any(|handle| handle.id() == *id))
            .cloned()
            .collect::<Vec<_>>();
        for id in gone {
            self.retract(&id)?;
        }
        for handle in listed {
            self.announce(handle)?;
        }
        self.probe.succeeded();
        tracing::trace!(clusters = self.known.len(), "membership resynced");
        Ok(())
    }

    fn announce(&mut self, handle: ClusterHandle) -> Result<(), Interrupted> {
        if self.known.contains_key(handle.id()) {
            return Ok(());
        }
        tracing::info!(cluster = %handle.id(), "cluster joined");
        self.known.insert(handle.id().clone(), handle.clone());
        self.emit(MembershipEvent::ClusterAdded(handle))
    }

    fn retract(&mut self, id: &ClusterId) -> Result<(), Interrupted> {
        if self.known.remove(id).is_none() {
            return Ok(());
        }
        tracing::info!(cluster = %id, "cluster left");
        self.emit(MembershipEvent::ClusterRemoved(id.clone()))
    }

    fn emit(&self, event: MembershipEvent) -> Result<(), Interrupted> {
        self.tx.send(Ok(event)).map_err(|_| Interrupted::Closed)
    }

    async fn back_off(&mut self, err: SourceError, cancel: &CancellationToken) -> Interrupted {
        if let SourceError::Invalid(reason) = err {
            return Interrupted::Fatal(reason);
        }
        let delay = self.backoff.next_backoff().unwrap_or(Duration::from_secs(30));
        tracing::warn!(error = %err, ?delay, "membership discovery failed, retrying");
        tokio::select! {
            () = cancel.cancelled() => Interrupted::Cancelled,
            () = self.tx.closed() => Interrupted::Closed,
            () = tokio::time::sleep(delay) => Interrupted::Retry,
        }
    }
}
