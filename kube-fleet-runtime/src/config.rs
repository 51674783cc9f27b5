//! Process configuration for a [`Controller`](crate::controller::Controller)
//!
//! Every field has a default, so a config file only needs to mention what it changes:
//!
//! ```yaml
//! workers: 8
//! kinds: [Widget, Gadget]
//! leader_election:
//!   lease_name: widget-controller
//!   identity: instance-1
//! ```
use crate::{
    coordination::ConfigBuilder,
    health::Health,
    membership::{DiscoveryProvider, MembershipSource, StaticProvider},
    utils::ItemBackoff,
};
use kube_fleet_core::{ClusterClient, ClusterHandle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

/// How long the pipeline may go without progress before it is reported as not live
const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Errors from loading configuration
#[derive(Debug, Error)]
pub enum Error {
    /// The config file could not be read
    #[error("failed to read config from {1:?}: {0}")]
    ReadConfig(#[source] std::io::Error, PathBuf),
    /// The config is not valid YAML, or does not have the expected structure
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The config parsed, but its values cannot work together
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Convient alias for config results
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can be tuned about a controller
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of concurrent reconciles
    pub workers: usize,
    /// Resource kinds to watch in every cluster
    pub kinds: Vec<String>,
    /// Retry backoff of the work queue
    pub queue: QueueConfig,
    /// Lease based leader election
    pub leader_election: LeaderElectionConfig,
    /// Membership discovery
    pub membership: MembershipConfig,
    /// How long tasks get to finish when a cluster leaves or the controller stops
    pub shutdown_grace_secs: u64,
    /// Cluster ids for a static fleet
    pub clusters: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            kinds: Vec::new(),
            queue: QueueConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            membership: MembershipConfig::default(),
            shutdown_grace_secs: 5,
            clusters: Vec::new(),
        }
    }
}

/// Retry backoff of the work queue
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay
    pub max_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
        }
    }
}

impl QueueConfig {
    /// The per-item backoff policy described by this config
    #[must_use]
    pub fn backoff(&self) -> ItemBackoff {
        ItemBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
        )
    }
}

/// Lease based leader election
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LeaderElectionConfig {
    /// Whether instances compete for a lease, disable for single-instance deployments
    pub enabled: bool,
    /// Name of the lease record, shared by every instance of the controller
    pub lease_name: String,
    /// Identity of this instance, defaults to `$HOSTNAME`
    pub identity: Option<String>,
    /// How long the lease is valid without being renewed
    pub lease_duration_secs: u64,
    /// How often the leader renews the lease
    pub renew_interval_secs: u64,
    /// How long candidates wait between attempts to acquire the lease
    pub retry_period_secs: u64,
    /// Timeout for every call to the lease store
    pub api_timeout_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: "kube-fleet".to_string(),
            identity: None,
            lease_duration_secs: 15,
            renew_interval_secs: 10,
            retry_period_secs: 2,
            api_timeout_secs: 4,
        }
    }
}

impl LeaderElectionConfig {
    /// The elector config, still to be validated with [`ConfigBuilder::finish`]
    #[must_use]
    pub fn builder(&self) -> ConfigBuilder {
        let identity = self.identity.clone().unwrap_or_else(default_identity);
        ConfigBuilder {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_interval: Duration::from_secs(self.renew_interval_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            ..ConfigBuilder::new(self.lease_name.clone(), identity)
        }
    }
}

/// `$HOSTNAME` when set (the pod name in most deployments), otherwise a random name
fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("kube-fleet-{:08x}", rand::rng().random::<u32>()))
}

/// Membership discovery
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MembershipConfig {
    /// First retry delay after a failed discovery
    pub base_backoff_ms: u64,
    /// Upper bound for discovery retry delays
    pub max_backoff_secs: u64,
    /// How often the full cluster list is fetched while subscribed
    pub resync_period_secs: u64,
    /// How recent the last successful discovery must be for the controller to be ready
    pub freshness_secs: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1000,
            max_backoff_secs: 30,
            resync_period_secs: 30,
            freshness_secs: 60,
        }
    }
}

impl MembershipConfig {
    /// A [`DiscoveryProvider`] over `source` with the configured backoff and resync period
    #[must_use]
    pub fn discovery<S: MembershipSource>(&self, source: S) -> DiscoveryProvider<S> {
        DiscoveryProvider::new(source)
            .backoff(
                Duration::from_millis(self.base_backoff_ms),
                Duration::from_secs(self.max_backoff_secs),
            )
            .resync_period(Duration::from_secs(self.resync_period_secs))
    }
}

impl ControllerConfig {
    /// Parse a config from YAML
    ///
    /// # Errors
    /// Fails if the YAML is malformed or contains unknown fields. Values are not validated.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML config file
    ///
    /// # Errors
    /// Fails if the file cannot be read, or see [`ControllerConfig::from_yaml_str`].
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|source| Error::ReadConfig(source, path.as_ref().into()))?;
        Self::from_yaml_str(&data)
    }

    /// Check that the values can work together
    ///
    /// # Errors
    /// Returns `Error::Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Invalid("workers must be at least 1".into()));
        }
        if self.kinds.is_empty() {
            return Err(Error::Invalid("kinds may not be empty".into()));
        }
        if self.kinds.iter().any(String::is_empty) {
            return Err(Error::Invalid("kinds may not contain an empty kind".into()));
        }
        if self.queue.base_delay_ms == 0 || self.queue.backoff().base > self.queue.backoff().max {
            return Err(Error::Invalid(
                "queue.base_delay_ms must be positive and not exceed queue.max_delay_secs".into(),
            ));
        }
        let membership = &self.membership;
        if membership.base_backoff_ms == 0
            || Duration::from_millis(membership.base_backoff_ms) > Duration::from_secs(membership.max_backoff_secs)
        {
            return Err(Error::Invalid(
                "membership.base_backoff_ms must be positive and not exceed membership.max_backoff_secs".into(),
            ));
        }
        if membership.resync_period_secs == 0 || membership.freshness_secs == 0 {
            return Err(Error::Invalid(
                "membership.resync_period_secs and membership.freshness_secs must be positive".into(),
            ));
        }
        if self.leader_election.enabled {
            self.leader_election
                .builder()
                .finish()
                .map_err(|err| Error::Invalid(err.to_string()))?;
        }
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.is_empty() || !seen.insert(cluster) {
                return Err(Error::Invalid(format!("cluster id {cluster:?} is empty or listed twice")));
            }
        }
        Ok(())
    }

    /// Grace period for stopping tasks
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// A health tracker using the configured discovery freshness
    #[must_use]
    pub fn health(&self) -> Health {
        Health::new(LIVENESS_WINDOW, Duration::from_secs(self.membership.freshness_secs))
    }

    /// A [`StaticProvider`] for the configured clusters, connecting to each with `connect`
    #[must_use]
    pub fn static_provider<F>(&self, mut connect: F) -> StaticProvider
    where
        F: FnMut(&str) -> Arc<dyn ClusterClient>,
    {
        let handles = self
            .clusters
            .iter()
            .map(|id| ClusterHandle::new(id.as_str(), connect(id)))
            .collect();
        StaticProvider::new(handles)
    }
}
