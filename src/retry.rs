//! Retry/backoff decorator applied uniformly to every outbound provider call.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RagError, Result};

/// Attempt budget, per-call timeout and exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: usize,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Upper bound on a single backoff sleep.
    pub max_delay: Duration,
    /// Time box applied to each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(16),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// Each attempt is time-boxed by `call_timeout`; an elapsed timeout counts as
    /// [`RagError::TransientUnavailable`]. Once retries are exhausted the last
    /// transient error is escalated to [`RagError::UpstreamFailure`]. Cancelling
    /// `cancel` aborts the in-flight attempt or backoff sleep immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RagError::Cancelled),
                res = tokio::time::timeout(self.call_timeout, op()) => match res {
                    Ok(result) => result,
                    Err(_) => Err(RagError::TransientUnavailable(format!(
                        "{label} timed out after {:?}",
                        self.call_timeout
                    ))),
                },
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(%label, attempt, ?delay, error = %err, "retrying provider call");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RagError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into_upstream()),
            }
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5) as u32;
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(20), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn recovers_after_transient_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = fast_policy()
            .run("test", &CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(RagError::TransientUnavailable("503".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeouts_exhaust_into_upstream_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = fast_policy()
            .run("slow", &CancellationToken::new(), || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(RagError::UpstreamFailure(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = fast_policy()
            .run("bad", &CancellationToken::new(), || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(RagError::InvalidInput("too long".into())) }
            })
            .await;
        assert_eq!(result, Err(RagError::InvalidInput("too long".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = fast_policy()
            .run("cancelled", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(RagError::Cancelled));
    }
}
