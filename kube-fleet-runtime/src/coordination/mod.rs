//! Lease-based leader election for redundant controller instances
//!
//! Every instance runs a [`LeaderElector`] against the same [`LeaseStore`]. The elector moves
//! through `Standby → Acquiring → Leading → Standby`: it claims the lease with a compare-and-swap
//! write, renews it on a fixed interval while leading, and steps down the moment a renewal fails.
//! Since every write is conditional on the version that was read, two instances can never both
//! believe they took over the same lease.
//!
//! The current state is published on a [`watch`] channel, so the rest of the application can
//! follow it:
//!
//! ```rust,ignore
//! let mut elector = LeaderElector::new(config, store);
//! let state = elector.state();
//! if let Some(fencing_token) = elector.acquire(&shutdown).await {
//!     // lead until `elector.hold(&shutdown)` returns
//! }
//! ```
//!
//! A client only acts on timestamps captured locally to infer the state of the election. The
//! timestamps in the lease record are informational, a change to the record is what tells
//! followers that the holder is still alive. This makes the election tolerant to clock skew
//! between instances, but not to wildly different clock rates.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;

mod store;
pub use store::{ClusterLeaseStore, LeaseStore, StoreError};

/// The jitter factor to use while attempting to acquire the lease.
const JITTER_FACTOR: f64 = 1.2;

/// Coordination error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The elector configuration is inconsistent
    #[error("invalid leader election config: {0}")]
    ConfigError(String),
    /// The lease store did not answer within `api_timeout`
    #[error("timeout while talking to the lease store")]
    TimeoutError,
    /// The lease store rejected the request
    #[error("lease store error: {0}")]
    Store(#[from] StoreError),
    /// Another instance owns the lease, or ours expired before it could be renewed
    #[error("lease lost: {0}")]
    LeaseLost(String),
}

/// Coordination result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The shared lease record
///
/// Mutated only through [`LeaseStore::create`] and [`LeaseStore::update`], which both fail when
/// someone else wrote the record first.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the current holder, `None` once released
    pub holder_identity: Option<String>,
    /// How long the holder may go without renewing before others may take over
    pub lease_duration_seconds: u64,
    /// When the current holder acquired the lease
    pub acquire_time: Option<SystemTime>,
    /// When the current holder last renewed the lease
    pub renew_time: Option<SystemTime>,
    /// Incremented every time the lease changes hands
    ///
    /// Writes made on behalf of a leader can carry this token, so a stale leader's writes can be
    /// told apart from the current leader's.
    pub fencing_token: u64,
    /// How many times the lease changed hands
    pub lease_transitions: u32,
}

/// A [`LeaseRecord`] together with the store version it was read at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedLease {
    /// The record as stored
    pub record: LeaseRecord,
    /// Opaque version to pass back to [`LeaseStore::update`]
    pub version: String,
}

/// Fully validated configuration for use by a [`LeaderElector`] instance.
///
/// Construct an instance via [`ConfigBuilder::finish`].
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// The name of the lease record.
    pub name: String,
    /// The identity to use when the lease is acquired.
    ///
    /// Typically this value will directly correspond to the name of the pod running this process.
    pub identity: String,
    /// The duration that non-leader candidates will wait to force acquire leadership.
    /// This is measured against time of last observed change to the record.
    ///
    /// A client needs to wait a full `lease_duration` without observing a change to
    /// the record before it can attempt to take over. Thus `lease_duration` should be as short as
    /// possible (within your tolerance for clock skew rate) to avoid long failovers.
    pub lease_duration: Duration,
    /// How often the leader renews the lease, must be shorter than `lease_duration`.
    pub renew_interval: Duration,
    /// The duration which candidates wait between attempts to acquire the lease.
    pub retry_period: Duration,
    /// Timeout for every call to the lease store.
    pub api_timeout: Duration,
}

impl ConfigBuilder {
    /// Start from the usual defaults (15s lease, 10s renewal, 2s retry, 4s timeout)
    #[must_use]
    pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(4),
        }
    }

    /// Finish building leader elector config by validating this config builder.
    ///
    /// # Errors
    /// Will return `Error::ConfigError` if this member's fields are invalid according to the
    /// following constraints:
    /// - `name` and `identity` must not be empty strings;
    /// - `lease_duration` must be greater than `renew_interval`;
    /// - `renew_interval` must be greater than `JITTER_FACTOR * retry_period`;
    /// - `renew_interval` must be greater than `api_timeout`;
    /// - a renewal that takes the whole `api_timeout` must still finish within `lease_duration`;
    /// - all durations must be at least 1 second.
    pub fn finish(self) -> Result<Config> {
        if self.name.is_empty() {
            return Err(Error::ConfigError("name may not be empty".into()));
        }
        if self.identity.is_empty() {
            return Err(Error::ConfigError("identity may not be empty".into()));
        }
        if self.lease_duration <= self.renew_interval {
            return Err(Error::ConfigError(
                "lease_duration must be greater than renew_interval".into(),
            ));
        }
        if self.renew_interval <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::ConfigError(format!(
                "renew_interval must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        if self.renew_interval <= self.api_timeout {
            return Err(Error::ConfigError(
                "renew_interval must be greater than api_timeout".into(),
            ));
        }
        if self.renew_interval + self.api_timeout >= self.lease_duration {
            return Err(Error::ConfigError(
                "renew_interval + api_timeout must be less than lease_duration".into(),
            ));
        }
        for (field, value) in [
            ("lease_duration", self.lease_duration),
            ("renew_interval", self.renew_interval),
            ("retry_period", self.retry_period),
            ("api_timeout", self.api_timeout),
        ] {
            if value.as_secs() < 1 {
                return Err(Error::ConfigError(format!("{field} must be at least 1 second")));
            }
        }
        Ok(Config(self))
    }
}

/// Different states which a leader elector may be in.
#[derive(Serialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// Not leading and not trying to.
    Standby,
    /// Trying to claim the lease.
    Acquiring,
    /// This instance holds the lease.
    Leading {
        /// The fencing token of the term this instance leads.
        fencing_token: u64,
    },
}

impl LeaderState {
    /// Check if currently in `Leading` state.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leading { .. })
    }
}

/// The last version of the lease this instance has seen, and when it saw it change
struct Observed {
    lease: VersionedLease,
    changed_at: Instant,
}

/// Acquires and maintains a lease to establish leadership
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: ConfigBuilder,
    observed: Option<Observed>,
    /// The state signal, which always reflects the current state of this elector.
    state_tx: watch::Sender<LeaderState>,
}

impl LeaderElector {
    /// Create an elector in `Standby`
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn LeaseStore>) -> Self {
        let (state_tx, _) = watch::channel(LeaderState::Standby);
        Self {
            store,
            config: config.0,
            observed: None,
            state_tx,
        }
    }

    /// The identity this elector claims the lease with
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Get a handle to the state signal of this elector.
    ///
    /// This signal receiver may be embedded in other parts of a program and used to govern actions
    /// taken by the app in accordance with leader election state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state_tx.subscribe()
    }

    /// The fencing token of the current term, if leading
    #[must_use]
    pub fn fencing_token(&self) -> Option<u64> {
        match *self.state_tx.borrow() {
            LeaderState::Leading { fencing_token } => Some(fencing_token),
            _ => None,
        }
    }

    fn set_state(&self, state: LeaderState) {
        let changed = self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            tracing::info!(identity = %self.config.identity, ?state, "leader state changed");
        }
    }

    /// Retry claiming the lease until it succeeds or `cancel` fires
    ///
    /// Returns the fencing token of the new term, or `None` if cancelled.
    #[tracing::instrument(skip_all, fields(identity = %self.config.identity, lease = %self.config.name))]
    pub async fn acquire(&mut self, cancel: &CancellationToken) -> Option<u64> {
        self.set_state(LeaderState::Acquiring);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(Some(fencing_token)) => {
                    self.set_state(LeaderState::Leading { fencing_token });
                    return Some(fencing_token);
                }
                Ok(None) => tracing::debug!("lease is held elsewhere"),
                Err(err) => tracing::warn!(error = %err, "failed to acquire lease"),
            }
            let jitter = rand::rng().random_range(1.0..JITTER_FACTOR);
            let delay = self.config.retry_period.mul_f64(jitter);
            tokio::select! {
                () = cancel.cancelled() => {
                    self.set_state(LeaderState::Standby);
                    return None;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Keep renewing the lease until `cancel` fires or a renewal fails
    ///
    /// Returns `Ok` when cancelled while still leading. Any failure to renew moves the elector to
    /// `Standby` immediately and is returned, the caller must stop acting as leader. A renewal is
    /// never waited on past the moment our lease runs out, since another instance may take over
    /// from then on.
    ///
    /// # Errors
    /// [`Error::LeaseLost`] when the lease ran out or was taken over, and the store's error when a
    /// renewal was rejected or timed out.
    #[tracing::instrument(skip_all, fields(identity = %self.config.identity, lease = %self.config.name))]
    pub async fn hold(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.renew_interval) => {}
            }
            let remaining = self
                .lease_deadline()
                .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(Instant::now()));
            let renewed = if remaining.is_zero() {
                Err(Error::LeaseLost("lease expired before it was renewed".into()))
            } else {
                timeout(remaining, self.try_acquire_or_renew())
                    .await
                    .unwrap_or_else(|_elapsed| Err(Error::LeaseLost("lease expired while renewing".into())))
            };
            match renewed {
                Ok(Some(_)) => tracing::trace!("lease renewed"),
                Ok(None) => return Err(self.step_down(Error::LeaseLost("taken over by another instance".into()))),
                Err(err) => return Err(self.step_down(err)),
            }
        }
    }

    fn step_down(&mut self, err: Error) -> Error {
        tracing::warn!(error = %err, "failed to renew lease, stepping down");
        self.observed = None;
        self.set_state(LeaderState::Standby);
        err
    }

    /// Give up the lease so another instance can take over without waiting for it to expire
    ///
    /// Failures are logged and otherwise ignored, the lease then simply expires.
    pub async fn release(&mut self) {
        if self.state_tx.borrow().is_leader() {
            if let Some(observed) = self.observed.take() {
                let mut record = observed.lease.record;
                record.holder_identity = None;
                record.renew_time = Some(SystemTime::now());
                let update = self.store.update(&self.config.name, record, &observed.lease.version);
                match timeout(self.config.api_timeout, update).await {
                    Ok(Ok(_)) => tracing::info!(identity = %self.config.identity, "lease released"),
                    Ok(Err(err)) => tracing::warn!(error = %err, "failed to release lease"),
                    Err(_) => tracing::warn!("timeout while releasing lease"),
                }
            }
        }
        self.observed = None;
        self.set_state(LeaderState::Standby);
    }

    /// When the lease we last observed runs out by our own clock
    fn lease_deadline(&self) -> Option<Instant> {
        self.observed
            .as_ref()
            .map(|observed| observed.changed_at + self.config.lease_duration)
    }

    /// Whether the lease we last observed has gone `lease_duration` without changing
    fn expired_locally(&self) -> bool {
        self.lease_deadline().is_none_or(|deadline| deadline <= Instant::now())
    }

    /// Attempt to acquire or renew the lease.
    ///
    /// Returns the fencing token if this instance holds the lease afterwards, `None` if someone
    /// else holds a lease that has not expired yet (or won the race for it).
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn try_acquire_or_renew(&mut self) -> Result<Option<u64>> {
        let leading = self.state_tx.borrow().is_leader();
        // 1. A leader trusts its own last write, everyone else needs the current record.
        if !leading {
            let current = timeout(self.config.api_timeout, self.store.get(&self.config.name))
                .await
                .map_err(|_err| Error::TimeoutError)??;
            self.observe(current);
        }

        // 2. Someone else holds a lease that we have not seen expire yet.
        let current = self.observed.as_ref().map(|observed| &observed.lease);
        let holder = current.and_then(|lease| lease.record.holder_identity.as_deref());
        let held_by_self = holder == Some(self.config.identity.as_str());
        if let (Some(holder), false) = (holder, held_by_self) {
            if !self.expired_locally() {
                tracing::trace!(%holder, "lease is held and has not expired");
                return Ok(None);
            }
            tracing::info!(%holder, "lease expired, taking over");
        }

        // 3. Build the new record.
        let now = SystemTime::now();
        let mut record = current.map(|lease| lease.record.clone()).unwrap_or_default();
        record.lease_duration_seconds = self.config.lease_duration.as_secs();
        record.renew_time = Some(now);
        if !held_by_self {
            record.holder_identity = Some(self.config.identity.clone());
            record.acquire_time = Some(now);
            record.fencing_token += 1;
            if current.is_some() {
                record.lease_transitions += 1;
            }
        }

        // 4. Write it back, conditional on the version we based it on. The write may land any time
        // after it was sent, so our term is counted from here rather than from the response.
        let sent = Instant::now();
        let write = match current {
            None => timeout(self.config.api_timeout, self.store.create(&self.config.name, record)).await,
            Some(lease) => {
                let version = lease.version.clone();
                timeout(self.config.api_timeout, self.store.update(&self.config.name, record, &version)).await
            }
        };
        match write.map_err(|_err| Error::TimeoutError)? {
            Ok(lease) => {
                let fencing_token = lease.record.fencing_token;
                self.observed = Some(Observed { lease, changed_at: sent });
                Ok(Some(fencing_token))
            }
            // lost the race against another candidate, re-read on the next attempt
            Err(StoreError::Conflict) if !leading => {
                self.observed = None;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record what the store returned, restarting the expiry clock if the record changed
    fn observe(&mut self, lease: Option<VersionedLease>) {
        let Some(lease) = lease else {
            self.observed = None;
            return;
        };
        match &mut self.observed {
            Some(observed) if observed.lease == lease => {}
            slot => {
                *slot = Some(Observed {
                    lease,
                    changed_at: Instant::now(),
                });
            }
        }
    }
}
