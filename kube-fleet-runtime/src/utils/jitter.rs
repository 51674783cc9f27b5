use super::ItemBackoff;
use backoff::backoff::Backoff;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with "full jitter"
///
/// Every delay is drawn uniformly from `[0, min(max, base * 2^n)]`, which spreads out retries from
/// many callers that started failing at the same moment.
#[derive(Clone, Debug)]
pub struct FullJitterBackoff {
    ceiling: ItemBackoff,
    attempts: u32,
}

impl FullJitterBackoff {
    /// Create a policy whose ceiling doubles from `base` up to `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            ceiling: ItemBackoff::new(base, max),
            attempts: 0,
        }
    }
}

impl Backoff for FullJitterBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        let ceiling = self.ceiling.delay(self.attempts);
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Some(Duration::from_nanos(rand::rng().random_range(0..=nanos)))
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}
