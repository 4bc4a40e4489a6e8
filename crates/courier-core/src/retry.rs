//! Bounded retry with linear backoff.

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; attempt `n+1` waits `n * base_delay`.
    pub base_delay: Duration,
    /// Longest single wait. A provider asking for more ends the retries.
    pub max_wait: Duration,
}

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Wait before attempt `next_attempt` (2-based), capped at `max_wait`.
    ///
    /// A provider `retry_after` wins if longer than the linear step; `None`
    /// when it exceeds `max_wait`.
    pub fn delay_before(&self, next_attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        let linear = (self.base_delay * next_attempt.saturating_sub(1)).min(self.max_wait);
        match retry_after {
            Some(d) if d > self.max_wait => None,
            Some(d) if d > linear => Some(d),
            _ => Some(linear),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is used up.
///
/// Failures come back as [`Error::RetriesExhausted`] carrying the attempt count
/// and the last error, so callers can classify the root cause.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if e.is_retryable() && attempt < max => {
                let Some(wait) = policy.delay_before(attempt + 1, e.retry_after()) else {
                    warn!(label, attempt, error = %e, max_wait_secs = policy.max_wait.as_secs(), "provider wait exceeds ceiling, giving up");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                };
                warn!(label, attempt, max, error = %e, wait_ms = wait.as_millis() as u64, "attempt failed, retrying");
                if !wait.is_zero() {
                    sleep(wait).await;
                }
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
        }
    }
}
