//! Reconnect backoff: exponential ceiling, full jitter, bounded attempts

use rand::Rng;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_attempts,
            attempt: 0,
        }
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Upper bound of the delay before retry number `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Record a failure and return how long to wait, or `None` once the
    /// attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt += 1;

        let ceiling_ms = ceiling.as_millis() as u64;
        let jittered = if ceiling_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=ceiling_ms)
        };
        Some(Duration::from_millis(jittered))
    }
}
