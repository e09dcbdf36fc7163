//! Bounded retry with exponential backoff for retryable collaborator failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExternalCallError;

/// How often and how patiently a failing external call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `1` disables retrying.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX).min(20);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(backoff.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ExternalCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalCallError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt + 1 < max_attempts => {
                    let wait = self.delay_for(attempt);
                    tracing::warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts,
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
