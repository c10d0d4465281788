//! Bounded retry with linear backoff, run inside a caller deadline.
//!
//! A logical operation is a loop of attempts. Retryable failures
//! (transport errors, 5xx, 429) sleep `attempt * base_delay` and try
//! again until `max_retries` extra attempts are spent. The whole loop,
//! sleeps included, runs under the optional [`CallContext`] deadline;
//! crossing it yields [`ComfyUIApiError::DeadlineExceeded`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::ComfyUIApiError;

/// Tunable parameters for one backend's HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Timeout applied to each individual attempt.
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Backoff unit; the delay after attempt `n` is `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy for calls that must not be retried.
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Total attempts including the first.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Caller-supplied bound on a whole logical operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline beyond the per-attempt timeouts.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Deadline `timeout` from now; unbounded when that is past the end of
    /// representable time.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Run `attempt_fn` until it succeeds, fails definitively, runs out of
/// retries, or the context deadline passes.
///
/// `attempt_fn` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &CallContext,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, ComfyUIApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ComfyUIApiError>>,
{
    let attempts = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = policy.total_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "ComfyUI call failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    };

    match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, attempts)
            .await
            .map_err(|_| ComfyUIApiError::DeadlineExceeded)?,
        None => attempts.await,
    }
}
