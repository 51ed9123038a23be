//! Retry policy for transient gateway failures
//!
//! Only transport failures are retried. A semantically wrong generation is
//! never retried blindly; regeneration is the orchestrator's explicit,
//! single-shot response to a validation failure.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::conductor::AgentError;
use crate::db::MemoryError;
use crate::llm::GatewayError;

/// Errors the retry loop knows how to classify
pub trait Retryable {
    /// True for failures that may succeed on a later attempt
    fn is_transient(&self) -> bool;

    /// The error reported when the caller cancels mid-retry
    fn cancelled() -> Self;
}

impl Retryable for GatewayError {
    fn is_transient(&self) -> bool {
        GatewayError::is_transient(self)
    }

    fn cancelled() -> Self {
        GatewayError::Cancelled
    }
}

impl Retryable for AgentError {
    fn is_transient(&self) -> bool {
        matches!(self, AgentError::Gateway(e) if e.is_transient())
    }

    fn cancelled() -> Self {
        AgentError::Gateway(GatewayError::Cancelled)
    }
}

impl Retryable for MemoryError {
    fn is_transient(&self) -> bool {
        matches!(self, MemoryError::Embedding(e) if e.is_transient())
    }

    fn cancelled() -> Self {
        MemoryError::Embedding(GatewayError::Cancelled)
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `retry` (0-based): initial * 2^retry, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent
    ///
    /// Each call of `op` is counted in `attempts`. Both the call and the
    /// backoff sleep are abandoned as soon as `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        attempts: &mut u32,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(E::cancelled());
            }

            *attempts += 1;
            let result = tokio::select! {
                result = op() => result,
                _ = cancel.cancelled() => return Err(E::cancelled()),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        label,
                        retry + 1,
                        self.max_retries + 1,
                        e,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(E::cancelled()),
                    }
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000));

        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transient_until_budget_spent() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let mut attempts = 0;

        let result: Result<(), GatewayError> = policy
            .run("generate", &CancellationToken::new(), &mut attempts, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Unavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let mut attempts = 0;

        let result: Result<u32, GatewayError> = policy
            .run("embed", &CancellationToken::new(), &mut attempts, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::Timeout(1))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut attempts = 0;

        let result: Result<(), AgentError> = policy
            .run("plan", &CancellationToken::new(), &mut attempts, || async {
                Err(AgentError::Planning("no JSON array".into()))
            })
            .await;

        assert!(matches!(result, Err(AgentError::Planning(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(2, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let mut attempts = 0;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), GatewayError> = policy
            .run("generate", &cancel, &mut attempts, || async {
                Err(GatewayError::Unavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(attempts, 1);
    }
}
