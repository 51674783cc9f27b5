//! Discovers which clusters belong to the fleet
//!
//! A [`Provider`] is the single source of truth for fleet membership. It emits one
//! [`MembershipEvent::ClusterAdded`] for every cluster visible when it starts, and then keeps
//! reflecting additions and removals. Delivery is at-least-once: consumers must tolerate a
//! repeated `ClusterAdded` for a cluster they already know.
//!
//! Two backends are provided: [`StaticProvider`] for a fixed list of clusters, and
//! [`DiscoveryProvider`] for a dynamic [`MembershipSource`].
use crate::health::DiscoveryProbe;
use futures::stream::BoxStream;
use kube_fleet_core::{ClusterHandle, ClusterId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod discovery;
mod static_provider;

pub use discovery::{DiscoveryProvider, MembershipSource, SourceError, SourceEvent};
pub use static_provider::StaticProvider;

/// A change to the set of clusters in the fleet
#[derive(Clone, Debug)]
pub enum MembershipEvent {
    /// A cluster joined (or was re-announced)
    ClusterAdded(ClusterHandle),
    /// A cluster left, all work for it must stop
    ClusterRemoved(ClusterId),
}

impl MembershipEvent {
    /// The cluster the event is about
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        match self {
            MembershipEvent::ClusterAdded(handle) => handle.id(),
            MembershipEvent::ClusterRemoved(id) => id,
        }
    }
}

/// Errors that end a membership stream
///
/// Transient failures are retried by the provider itself and never show up here.
#[derive(Error, Debug)]
pub enum Error {
    /// Membership is misconfigured and cannot be discovered at all
    #[error("invalid membership configuration: {0}")]
    Fatal(String),
}

/// Convient alias for membership results
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A source of fleet membership
pub trait Provider: Send + Sync + 'static {
    /// Start discovering clusters
    ///
    /// The stream ends after `cancel` fires, or right after yielding a fatal [`Error`].
    /// Successful discovery passes are reported to `probe`.
    fn start(&self, probe: DiscoveryProbe, cancel: CancellationToken) -> BoxStream<'static, Result<MembershipEvent>>;
}
