//! Timeouts and backoff for object-backend calls.

use super::backend::{BackendError, BackendResult};
use std::{future::Future, time::Duration};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    /// Bound on each individual attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Run one backend call bounded by `timeout`.
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> BackendResult<T>
where
    Fut: Future<Output = BackendResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// Retry an idempotent backend call with exponential backoff.
///
/// Only transient failures are retried; anything else returns at once.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.base_delay;
    let mut last_err = None;

    for attempt in 0..attempts {
        match with_timeout(policy.timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                let is_last = attempt + 1 >= attempts;
                warn!(op, attempt = attempt + 1, error = %err, "backend call failed");
                last_err = Some(err);
                if is_last {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| BackendError::Unavailable(format!("{op} never ran"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&fast_policy(3), "read", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackendError::Unavailable("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: BackendResult<()> = with_retry(&fast_policy(2), "read", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: BackendResult<()> = with_retry(&fast_policy(5), "read", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::NotFound("x".into()))
        })
        .await;

        assert!(matches!(result, Err(BackendError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };
        let result: BackendResult<()> = with_retry(&policy, "read", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(BackendError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
