//! Helpers shared by the runtime components

mod item_backoff;
mod jitter;
mod watch_retry;

pub use item_backoff::ItemBackoff;
pub use jitter::FullJitterBackoff;
pub use watch_retry::WatchRetry;

use backoff::ExponentialBackoff;
use futures::TryStream;
use std::time::Duration;

/// How long a watch has to go without failing before its retry pauses start over
pub const WATCH_HEALTHY_RESET: Duration = Duration::from_secs(120);

/// The retry pacing every cluster watch gets
///
/// Pauses grow exponentially from 800ms to 30s, and only start over once the watch stayed healthy
/// for [`WATCH_HEALTHY_RESET`].
#[must_use]
pub fn paced_watch<S: TryStream>(watch: S) -> WatchRetry<S, ExponentialBackoff> {
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(800))
        .with_max_interval(Duration::from_secs(30))
        .with_randomization_factor(1.0)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();
    WatchRetry::new(watch, policy).reset_after(WATCH_HEALTHY_RESET)
}
