//! Shared retry logic
//!
//! Every component that talks to the backend (executor, connection prober,
//! schema bootstrapper, direct executor) retries through
//! [`retry_with_backoff`], so the backoff schedule is defined exactly once.
//!
//! The schedule is deterministic: attempt 0 runs immediately, attempt `k`
//! waits `base_delay * 2^k` first (500ms base gives 1s, 2s, 4s, ...). The
//! schedule is uncapped unless `max_delay_ms` is lowered.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff and attempt budget for one retry loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts (default: 2). Zero means "do not try".
    pub max_retries: u32,
    /// Base delay in milliseconds (default: 500ms)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: none)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: u64::MAX,
        }
    }
}

impl RetryPolicy {
    /// Same backoff, different attempt budget
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// Delay to wait before `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 1_u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Whether a failed attempt should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// Why a retry loop gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier declared the error terminal
    Aborted(E),
    /// Every attempt failed; `last` is `None` only for a zero budget
    Exhausted { last: Option<E>, attempts: u32 },
}

impl<E> RetryError<E> {
    /// The last error seen, if any
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Aborted(e) => Some(e),
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Information about an upcoming retry
#[derive(Debug, Clone)]
pub struct RetryInfo {
    /// The attempt about to run (1-based for retries)
    pub attempt: u32,
    /// Attempt budget
    pub max_retries: u32,
    /// How long we wait first
    pub delay: Duration,
    /// The error that triggered the retry
    pub error: String,
}

/// Callback type for retry events
pub type RetryCallback = Arc<dyn Fn(RetryInfo) + Send + Sync>;

/// Run `op` until it succeeds, the classifier aborts, or the budget runs out
///
/// `op` receives the 0-based attempt number. Attempts never overlap: each
/// delay and request completes before the next begins.
///
/// ```
/// use sqlbridge_core::retry::{retry_with_backoff, RetryDecision, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let policy = RetryPolicy { max_retries: 3, base_delay_ms: 1, max_delay_ms: 10 };
/// let result = retry_with_backoff(
///     &policy,
///     |attempt| async move { if attempt < 2 { Err("busy") } else { Ok(attempt) } },
///     |_| RetryDecision::Retry,
///     None,
/// )
/// .await;
/// assert_eq!(result.unwrap(), 2);
/// # });
/// ```
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    mut classify: C,
    on_retry: Option<&RetryCallback>,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryDecision,
    E: std::fmt::Display,
{
    let mut last: Option<E> = None;

    for attempt in 0..policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt);
            let error = last.as_ref().map(|e| e.to_string()).unwrap_or_default();
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "backing off before retry"
            );

            if let Some(callback) = on_retry {
                callback(RetryInfo {
                    attempt,
                    max_retries: policy.max_retries,
                    delay,
                    error,
                });
            }

            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(&err) {
                RetryDecision::Abort => return Err(RetryError::Aborted(err)),
                RetryDecision::Retry => last = Some(err),
            },
        }
    }

    Err(RetryError::Exhausted {
        last,
        attempts: policy.max_retries,
    })
}
