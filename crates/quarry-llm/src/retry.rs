use std::future::Future;
use std::time::Duration;

use crate::error::EmbedError;

/// Exponential backoff policy for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (0-based).
    ///
    /// A provider-supplied hint wins over the computed backoff; both are
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        computed.min(self.max_delay)
    }
}

/// Run `f`, retrying transient failures with backoff.
///
/// Once attempts are exhausted the last transient error is returned
/// unchanged; permanent errors are returned immediately.
///
/// # Errors
///
/// Returns the first permanent error or the last transient error.
pub async fn with_retry<T, F, Fut>(
    provider_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, EmbedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EmbedError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt + 1 >= attempts {
                    tracing::warn!(
                        provider = provider_name,
                        attempts,
                        "retries exhausted: {e}"
                    );
                    return Err(e);
                }
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::warn!(
                    provider = provider_name,
                    attempt = attempt + 1,
                    max = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "{e}, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn rate_limited() -> EmbedError {
        EmbedError::RateLimited {
            provider: "test".into(),
            retry_after: None,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4, None), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40, None), Duration::from_secs(30));
    }

    #[test]
    fn delay_honors_hint_within_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(120))),
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            "test",
            &RetryPolicy::default(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(rate_limited()) } else { Ok(n) } }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_returns_transient_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            "test",
            &RetryPolicy::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            "test",
            &RetryPolicy::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EmbedError::Permanent {
                        provider: "test".into(),
                        message: "bad key".into(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(EmbedError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let _ = with_retry(
            "test",
            &RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(30),
            },
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(rate_limited()) }
            },
        )
        .await;
        // 100ms + 200ms of backoff before the third attempt.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(attempt in 0u32..64, base_ms in 1u64..5000) {
            let policy = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(30),
            };
            let delay = policy.delay_for(attempt, None);
            prop_assert!(delay <= Duration::from_secs(30));
            prop_assert!(delay >= Duration::from_millis(base_ms).min(Duration::from_secs(30)));
        }
    }
}
