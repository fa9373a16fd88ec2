//! Retry with exponential backoff for transient gateway errors.

use crate::error::GatewayError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy applied inside each circuit-broken dependency call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (first try + retries).
    pub max_attempts: u32,
    /// Initial backoff.
    pub base: Duration,
    /// Backoff cap.
    pub cap: Duration,
    /// Whether to add up to 25% jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff for a 0-based attempt, respecting a rate-limit
    /// retry-after when the server's figure is larger.
    fn backoff(&self, attempt: u32, err: &GatewayError) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let with_jitter = if self.jitter {
            let jitter_ms = (exp.as_millis() as f64 * 0.25 * rand_fraction()) as u64;
            exp + Duration::from_millis(jitter_ms)
        } else {
            exp
        };
        if let GatewayError::RateLimited { retry_after_secs } = err {
            with_jitter.max(Duration::from_secs(*retry_after_secs))
        } else {
            with_jitter
        }
    }
}

/// Cheap pseudo-random fraction in [0, 1) for jitter; sub-second clock
/// noise is plenty here and keeps the rand crate out of the tree.
fn rand_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Execute an async operation with exponential backoff retry on transient
/// errors. Non-transient errors (auth, policy, invalid request) return
/// immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_transient() || attempt + 1 == attempts {
                    return Err(e);
                }
                let backoff = policy.backoff(attempt, &e);
                warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(GatewayError::Unavailable {
        message: "all retry attempts exhausted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = with_retry(&fast_policy(), || async { Ok::<_, GatewayError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = with_retry(&fast_policy(), || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Connection {
                        message: "reset".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(), || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::PolicyRejection {
                    message: "refused".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::PolicyRejection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(), || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Timeout { timeout_secs: 1 })
            }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
            jitter: false,
        };
        let err = GatewayError::Connection {
            message: "x".into(),
        };
        assert_eq!(policy.backoff(0, &err), Duration::from_millis(100));
        assert_eq!(policy.backoff(1, &err), Duration::from_millis(200));
        assert_eq!(policy.backoff(2, &err), Duration::from_millis(350));
        assert_eq!(policy.backoff(3, &err), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_respects_rate_limit_retry_after() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(8),
            jitter: false,
        };
        let err = GatewayError::RateLimited {
            retry_after_secs: 3,
        };
        assert_eq!(policy.backoff(0, &err), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(8),
            jitter: true,
        };
        let err = GatewayError::Connection {
            message: "x".into(),
        };
        let backoff = policy.backoff(0, &err);
        assert!(backoff >= Duration::from_millis(1000));
        assert!(backoff <= Duration::from_millis(1250));
    }
}
