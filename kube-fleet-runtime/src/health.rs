//! Liveness and readiness derived from the running pipeline
//!
//! The HTTP surface is left to the embedding application, which only needs to expose
//! [`Health::liveness`] and [`Health::readiness`] (or the serializable [`Health::report`]).
use crate::{coordination::LeaderState, queue::WorkQueue};
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

#[derive(Default)]
struct State {
    /// Last time the run loop made progress
    heartbeat: Option<Instant>,
    /// Last time membership discovery succeeded
    last_discovery: Option<Instant>,
    /// Membership is static and never goes stale
    settled: bool,
    leader: Option<LeaderState>,
    queue: Option<WorkQueue>,
}

struct Inner {
    state: Mutex<State>,
    liveness_window: Duration,
    freshness: Duration,
}

/// Shared health state of one controller
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct Health {
    inner: Arc<Inner>,
}

impl Default for Health {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }
}

impl Health {
    /// Create a health tracker
    ///
    /// The controller counts as live while its run loop made progress within `liveness_window`, and
    /// discovery counts as fresh while it succeeded within `freshness`.
    #[must_use]
    pub fn new(liveness_window: Duration, freshness: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                liveness_window,
                freshness,
            }),
        }
    }

    /// A probe the membership provider uses to report successful discovery
    #[must_use]
    pub fn discovery_probe(&self) -> DiscoveryProbe {
        DiscoveryProbe {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn heartbeat(&self) {
        self.inner.state.lock().heartbeat = Some(Instant::now());
    }

    pub(crate) fn stopped(&self) {
        let mut state = self.inner.state.lock();
        state.heartbeat = None;
        state.queue = None;
    }

    pub(crate) fn set_leader_state(&self, leader: LeaderState) {
        self.inner.state.lock().leader = Some(leader);
    }

    pub(crate) fn attach_queue(&self, queue: WorkQueue) {
        self.inner.state.lock().queue = Some(queue);
    }

    pub(crate) fn detach_queue(&self) {
        self.inner.state.lock().queue = None;
    }

    /// Whether the controller's run loop is making progress, leading or not
    #[must_use]
    pub fn liveness(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .heartbeat
            .is_some_and(|at| at.elapsed() <= self.inner.liveness_window)
    }

    /// Whether this instance leads and its membership view is fresh
    #[must_use]
    pub fn readiness(&self) -> bool {
        let state = self.inner.state.lock();
        let leading = matches!(state.leader, Some(LeaderState::Leading { .. }));
        leading && self.discovery_fresh(&state)
    }

    fn discovery_fresh(&self, state: &State) -> bool {
        state.settled
            || state
                .last_discovery
                .is_some_and(|at| at.elapsed() <= self.inner.freshness)
    }

    /// A point-in-time snapshot of everything health is derived from
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let live = self.liveness();
        let ready = self.readiness();
        let state = self.inner.state.lock();
        HealthReport {
            live,
            ready,
            leader: state.leader,
            queue_depth: state.queue.as_ref().map(WorkQueue::len),
            in_flight: state.queue.as_ref().map(WorkQueue::in_flight),
            discovery_age: state.last_discovery.map(|at| at.elapsed()),
        }
    }
}

/// Serializable snapshot returned by [`Health::report`]
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// See [`Health::liveness`]
    pub live: bool,
    /// See [`Health::readiness`]
    pub ready: bool,
    /// Leader election state, `None` before the controller started
    pub leader: Option<LeaderState>,
    /// Keys queued or in processing, `None` while the pipeline is not running
    pub queue_depth: Option<usize>,
    /// Keys currently being reconciled
    pub in_flight: Option<usize>,
    /// Time since membership discovery last succeeded
    pub discovery_age: Option<Duration>,
}

/// Handle through which a membership provider reports discovery health
#[derive(Clone)]
pub struct DiscoveryProbe {
    inner: Arc<Inner>,
}

impl DiscoveryProbe {
    /// Record a successful discovery pass
    pub fn succeeded(&self) {
        self.inner.state.lock().last_discovery = Some(Instant::now());
    }

    /// Mark membership as static, so it never goes stale
    pub fn settle(&self) {
        let mut state = self.inner.state.lock();
        state.settled = true;
        state.last_discovery = Some(Instant::now());
    }

    /// A probe that is not attached to any controller
    #[must_use]
    pub fn detached() -> Self {
        Health::default().discovery_probe()
    }
}
