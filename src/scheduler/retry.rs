//! Retry policy for failed transfer attempts

use crate::config::RetryConfig;
use crate::error::{FailureClass, SyncError};
use std::time::Duration;

/// What to do with an entry after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue again, not before the delay has passed
    RetryAfter(Duration),
    /// Park as `serverError` until a manual resume
    ServerError,
    /// Give up: `failed`
    Fail,
}

/// Exponential backoff with a cap and optional jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        let capped = base.min(self.max_delay_ms);

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped);
        }

        // ±jitter_factor randomness, never above the cap
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let with_jitter = (capped as f64 * (1.0 + jitter)) as u64;
        Duration::from_millis(with_jitter.min(self.max_delay_ms))
    }

    /// Decide the fate of an entry that has already been retried
    /// `retry_count` times and just failed with `error`
    pub fn decide(&self, retry_count: u32, error: &SyncError) -> RetryDecision {
        match error.failure_class() {
            FailureClass::Server => RetryDecision::ServerError,
            FailureClass::Transient | FailureClass::Storage => {
                if retry_count >= self.max_retries {
                    RetryDecision::Fail
                } else {
                    RetryDecision::RetryAfter(self.delay_for_retry(retry_count + 1))
                }
            }
            FailureClass::Cancelled | FailureClass::Fatal => RetryDecision::Fail,
        }
    }
}
