use super::ExternalError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            call_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Exponential backoff for the given 1-based attempt, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Upper bound on how long [`with_retry`] can run under this policy.
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|attempt| self.delay_for(attempt)).sum();
        self.call_timeout() * attempts + backoff
    }
}

/// Runs `call` with a per-attempt timeout, retrying transient failures with
/// backoff. Permanent failures return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.call_timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::Transient(format!(
                "{} timed out after {}ms",
                operation, policy.call_timeout_ms
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient external error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(ExternalError::Transient(format!(
                    "{} failed after {} attempts: {}",
                    operation, attempt, err
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            call_timeout_ms: 200,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            call_timeout_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&fast_policy(3), "describe", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExternalError::Transient("throttled".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(2), "describe", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::Transient("internal error".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ExternalError::Transient(msg)) if msg.contains("after 2 attempts")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&fast_policy(5), "start", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExternalError::Permanent("access denied".to_string()))
            }
        })
        .await;

        assert_eq!(result, Err(ExternalError::Permanent("access denied".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_transient() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            call_timeout_ms: 10,
        };
        let result: Result<(), _> = with_retry(&policy, "describe", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ExternalError::Transient(msg)) if msg.contains("timed out")));
    }

    #[test]
    fn worst_case_covers_every_attempt_and_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.worst_case(), Duration::from_millis(4 * 10_000 + 250 + 500 + 1_000));
        assert_eq!(fast_policy(1).worst_case(), Duration::from_millis(200));
    }
}
