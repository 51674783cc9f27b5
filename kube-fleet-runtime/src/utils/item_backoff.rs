use std::time::Duration;

/// Per-item exponential backoff used by the work queue
///
/// `delay(n)` is `base * 2^(n-1)`, capped at `max`. It is a pure function of the attempt count, so
/// the queue can recompute it at any time without keeping per-item backoff state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemBackoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ItemBackoff {
    /// Create a policy with the given bounds
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The delay to apply after `attempts` consecutive failures
    ///
    /// Zero attempts means no failure has happened yet, and yields no delay.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts - 1).min(100);
        let nanos = self
            .base
            .as_nanos()
            .saturating_mul(1_u128 << exponent)
            .min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}
