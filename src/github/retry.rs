//! Full-jitter retry combinator for 5xx/429/network errors (§4.B).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::errors::GitHubApiError;
use crate::github::error::is_retryable;

/// Retry policy: exponential base with full jitter, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

fn full_jitter_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(policy.max_delay.as_millis() as u64);
    let jittered = rand::rng().random_range(0..=capped.max(1));
    Duration::from_millis(jittered)
}

/// Run `attempt` up to `policy.max_attempts` times, sleeping a full-jitter backoff
/// between retryable failures. Errors that classify as non-retryable (auth,
/// not-found, validation, rate-limit — which has its own resume-time handling) are
/// returned immediately without consuming a retry.
pub async fn with_backoff<F, Fut, T>(policy: RetryPolicy, mut attempt: F) -> Result<T, GitHubApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GitHubApiError>>,
{
    let mut last_err = None;
    for attempt_number in 0..policy.max_attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err.code) {
                    return Err(err);
                }
                last_err = Some(err);
                if attempt_number + 1 < policy.max_attempts {
                    tokio::time::sleep(full_jitter_delay(&policy, attempt_number)).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GitHubErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let result = with_backoff(fast_policy(), || async { Ok::<_, GitHubApiError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_backoff(fast_policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(GitHubApiError::new("server error", GitHubErrorCode::Server))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_backoff(fast_policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GitHubApiError::new("still failing", GitHubErrorCode::Network))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_short_circuit_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_backoff(fast_policy(), move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GitHubApiError::new("not found", GitHubErrorCode::NotFound))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
