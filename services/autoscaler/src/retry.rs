//! Bounded retry for collaborator calls.
//!
//! Every outbound call runs under a [`RetryPolicy`]: a per-attempt timeout
//! and a fixed attempt budget. The policy is injected into client
//! constructors rather than baked into call sites, so non-idempotent
//! operations can carry a no-retry variant and tests can tighten timeouts.
//! There is no backoff; the control loop's next tick is the real retry.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, counting the first call.
    pub attempts: u32,
    /// Upper bound on each individual attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// One retry after the first failure. For idempotent reads and
    /// tolerant-of-repeat writes (terminate, cordon, evict).
    pub fn standard(timeout: Duration) -> Self {
        Self { attempts: 2, timeout }
    }

    /// Exactly one attempt. For calls that must not be repeated blindly,
    /// such as launching instances.
    pub fn no_retry(timeout: Duration) -> Self {
        Self { attempts: 1, timeout }
    }

    /// Run `call` under this policy. `what` labels the operation in logs.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    warn!(
                        operation = what,
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "Call failed"
                    );
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(
                        operation = what,
                        attempt,
                        attempts = self.attempts,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Call timed out"
                    );
                    last_err = Some(anyhow!(
                        "{what} timed out after {}ms",
                        self.timeout.as_millis()
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{what}: no attempts configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_success_needs_no_retry() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::standard(Duration::from_secs(1));

        let out: i32 = policy
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await
            .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::standard(Duration::from_secs(1));

        let out: i32 = policy
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(anyhow!("transient"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let policy = RetryPolicy::standard(Duration::from_secs(1));

        let err = policy
            .run("op", || async { Err::<i32, _>(anyhow!("still broken")) })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("still broken"));
    }

    #[tokio::test]
    async fn slow_attempt_times_out_and_retries() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::standard(Duration::from_millis(20));

        let out: i32 = policy
            .run("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok(1)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_retry_policy_stops_after_one_attempt() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::no_retry(Duration::from_secs(1));

        let err = policy
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(anyhow!("boom")) }
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
