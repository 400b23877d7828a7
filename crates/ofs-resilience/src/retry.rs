//! Exponential backoff retry policy

use ofs_model::{RemoteError, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Decides whether and when to retry a failed call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether `attempt` (0-based count of retries already made) may be
    /// followed by another one after `err`
    #[must_use]
    pub fn should_retry(&self, err: &RemoteError, attempt: u32) -> bool {
        attempt < self.config.max_retries && err.trips_breaker()
    }

    /// Delay before retry number `attempt + 1`, without jitter
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt + 1`
    ///
    /// With jitter enabled the delay is drawn uniformly from `[d/2, d]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
