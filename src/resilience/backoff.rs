//! Exponential backoff with jitter.
//!
//! Used by the accept loop when the worker pool rejects a new connection and
//! when `accept()` itself keeps failing (e.g. file descriptor exhaustion).

use std::time::Duration;

use rand::Rng;

use crate::config::ListenerConfig;

/// Bounded retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            attempts: config.accept_retry_attempts,
            base: Duration::from_millis(config.accept_retry_base_ms),
            max: Duration::from_millis(config.accept_retry_max_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        let capped = self.base.saturating_mul(factor).min(self.max);

        // Up to 10% jitter keeps simultaneous retries from lining up.
        let jitter_range = capped.as_micros() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        capped + Duration::from_micros(jitter)
    }
}
