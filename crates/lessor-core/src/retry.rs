//! Retry policy: backoff for transient store contention.

use rand::Rng;
use std::time::Duration;

/// Retry policy for `LeaseError::Busy`.
///
/// Conflict and validation errors are never retried; the caller decides.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Random extra delay in `[0, jitter)`, spreads out competing agents.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Default for SQLite lock contention: 25ms, 50ms, 100ms, 200ms, 400ms.
    pub fn default_busy() -> Self {
        Self {
            base_delay: Duration::from_millis(25),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_retries: 5,
            jitter: Duration::from_millis(10),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default_busy()
        }
    }

    /// Delay before retry number `retry` (1-indexed), without jitter.
    ///
    /// delay = min(base_delay * multiplier^(retry - 1), max_delay)
    pub fn next_delay(&self, retry: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(retry.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// `next_delay` plus random jitter.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.next_delay(retry) + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_busy()
    }
}
