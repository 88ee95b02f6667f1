use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter, used for bus reconnect loops.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Sensible defaults for transport retries: 250 ms doubling up to 15 s.
    #[must_use]
    pub fn transport() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(15))
    }

    /// The next delay: `min(max, base * 2^attempt)`, jittered uniformly
    /// over `[delay/2, delay]` so reconnecting agents do not stampede.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let half = exp / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    /// Reset after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
