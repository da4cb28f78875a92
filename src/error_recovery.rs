//! Retry policy for transient transport failures.
//!
//! Only the session uses this. Device-reported errors are never retried; a
//! rejected command fails the same way on every attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each retry after that.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Sleep for the backoff that precedes retry number `retry`.
    pub async fn backoff(&self, retry: u32) {
        let delay = self.delay_for(retry);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}
