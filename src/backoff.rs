//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    /// plus up to 25% jitter, never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.raw(attempt);
        let jitter_range = exp.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        (exp + Duration::from_millis(jitter)).min(self.max)
    }

    fn raw(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.min(20));
        self.base.saturating_mul(multiplier).min(self.max)
    }
}
