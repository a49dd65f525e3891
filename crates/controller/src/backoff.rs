use std::time::Duration;

use rand::Rng;

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped, plus up to 10% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max: max.max(base) } }

    /// Delay before the retry following the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let raw = self.ceiling(failures);
        let jitter_ms = (raw.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return raw;
        }
        (raw + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))).min(self.max)
    }

    /// Un-jittered delay.
    pub fn ceiling(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.checked_mul(1u32 << exp).unwrap_or(self.max).min(self.max)
    }
}
