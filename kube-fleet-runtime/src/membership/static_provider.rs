use super::{Error, MembershipEvent, Provider, Result};
use crate::health::DiscoveryProbe;
use futures::{future, stream, stream::BoxStream, StreamExt};
use kube_fleet_core::ClusterHandle;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// A fleet whose members are fixed up front, typically from configuration
#[derive(Clone, Debug, Default)]
pub struct StaticProvider {
    clusters: Vec<ClusterHandle>,
}

impl StaticProvider {
    /// Announce exactly these clusters
    #[must_use]
    pub fn new(clusters: Vec<ClusterHandle>) -> Self {
        Self { clusters }
    }

    /// Add one more cluster
    #[must_use]
    pub fn cluster(mut self, handle: ClusterHandle) -> Self {
        self.clusters.push(handle);
        self
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for handle in &self.clusters {
            if handle.id().as_str().is_empty() {
                return Err(Error::Fatal("cluster id may not be empty".into()));
            }
            if !seen.insert(handle.id()) {
                return Err(Error::Fatal(format!("cluster {} is listed twice", handle.id())));
            }
        }
        Ok(())
    }
}

impl Provider for StaticProvider {
    fn start(&self, probe: DiscoveryProbe, cancel: CancellationToken) -> BoxStream<'static, Result<MembershipEvent>> {
        if let Err(err) = self.validate() {
            tracing::error!(error = %err, "static membership rejected");
            return stream::once(future::ready(Err(err))).boxed();
        }
        tracing::info!(clusters = self.clusters.len(), "announcing static membership");
        probe.settle();
        let added = self
            .clusters
            .iter()
            .cloned()
            .map(|handle| Ok(MembershipEvent::ClusterAdded(handle)))
            .collect::<Vec<_>>();
        // membership never changes, so just hold the stream open until cancelled
        let parked = stream::once(async move { cancel.cancelled().await })
            .filter_map(|()| future::ready(None::<Result<MembershipEvent>>));
        stream::iter(added).chain(parked).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::StaticProvider;
    use crate::{health::DiscoveryProbe, membership::Provider, memory::MemoryCluster};
    use futures::{poll, StreamExt};
    use kube_fleet_core::ClusterHandle;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn handle(id: &str) -> ClusterHandle {
        ClusterHandle::new(id, Arc::new(MemoryCluster::new()))
    }

    #[tokio::test]
    async fn announces_every_cluster_then_parks_until_cancelled() {
        let cancel = CancellationToken::new();
        let provider = StaticProvider::new(vec![handle("east"), handle("west")]);
        let mut events = provider.start(DiscoveryProbe::detached(), cancel.clone());
        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.push(events.next().await.unwrap().unwrap().cluster_id().to_string());
        }
        assert_eq!(ids, ["east", "west"]);
        assert!(poll!(events.next()).is_pending());
        cancel.cancel();
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_fatal() {
        let provider = StaticProvider::new(vec![handle("east")]).cluster(handle("east"));
        let mut events = provider.start(DiscoveryProbe::detached(), CancellationToken::new());
        assert!(events.next().await.unwrap().is_err());
        assert!(events.next().await.is_none());
    }
}
