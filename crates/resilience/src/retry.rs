//! Explicit higher-order retry.
//!
//! The operation, the retriability predicate, and the [`BackoffPolicy`] are
//! all passed in by the call site, so each site's retry behavior can be read
//! off the call itself.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::backoff::BackoffPolicy;

/// The last error an operation produced, with how many attempts were made.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub error: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.error)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. A failure for which
/// `is_retryable` returns false is returned immediately without waiting.
pub async fn retry<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    op: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    retry_with_notify(policy, op, is_retryable, |_, _, _| {}).await
}

/// Like [`retry`], calling `on_retry(failed_attempt, &error, wait)` before
/// each backoff sleep.
pub async fn retry_with_notify<T, E, F, Fut, P, N>(
    policy: &BackoffPolicy,
    mut op: F,
    is_retryable: P,
    mut on_retry: N,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: FnMut(u32, &E, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !is_retryable(&error) {
                    return Err(RetryError {
                        attempts: attempt,
                        error,
                    });
                }
                let wait = policy.compute_wait(attempt - 1);
                debug!(
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "Retrying after failure"
                );
                on_retry(attempt, &error, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), max_attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();

        let result = retry(
            &policy(3),
            |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok("done")
                }
            },
            |e| *e == TestError::Transient,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s base waits plus under 20% jitter each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3_600));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry(
            &policy(5),
            |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Permanent)
            },
            |e| *e == TestError::Transient,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.error, TestError::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let result: Result<(), _> =
            retry(&policy(4), |_| async { Err(TestError::Transient) }, |_| true).await;
        assert_eq!(result.unwrap_err().attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn notify_sees_each_failed_attempt() {
        let mut seen = Vec::new();
        let result: Result<(), _> = retry_with_notify(
            &policy(3),
            |attempt| async move { Err::<(), _>(attempt) },
            |_| true,
            |attempt, error, wait| {
                assert_eq!(attempt, *error);
                seen.push((attempt, wait >= Duration::from_secs(1)));
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(seen, vec![(1, true), (2, true)]);
    }
}
