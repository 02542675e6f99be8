//! Fixed-delay retry policy.
//!
//! Only transient errors are retried. Every other error returns on the
//! first attempt.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Retry settings: total attempts and the pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Run `op`, retrying transient failures.
    pub async fn execute<T, F, Fut>(&self, label: &str, op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.execute_with(label, op, |_, _| {}).await
    }

    /// Run `op`, retrying transient failures and reporting each failed
    /// attempt to `on_failure` before sleeping.
    pub async fn execute_with<T, F, Fut, C>(
        &self,
        label: &str,
        mut op: F,
        mut on_failure: C,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
        C: FnMut(u32, &SyncError),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("[retry] {} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    log::warn!(
                        "[retry] {} failed (attempt {}/{}): {}",
                        label,
                        attempt,
                        attempts,
                        e
                    );
                    on_failure(attempt, &e);
                    tokio::time::sleep(self.delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("[retry] {} gave up after {} attempt(s): {}", label, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}
