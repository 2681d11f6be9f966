//! Retry logic and backoff strategies
//!
//! Attempts are counted from 1; a policy with `max_attempts = 3` calls the
//! operation at most three times.

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy trait
pub trait RetryPolicy: Send + Sync {
    /// Whether another attempt follows the failed attempt number `attempt`.
    fn should_retry(&self, attempt: u32, error: &dyn std::fmt::Display) -> bool {
        let _ = error;
        attempt < self.max_attempts()
    }

    /// Wait before the attempt following attempt number `attempt`.
    fn delay(&self, attempt: u32) -> Duration;

    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let delay_ms = base_ms.min(self.config.max_delay_ms as f64).max(0.0) as u64;

        let jitter = if self.config.jitter_ms > 0 {
            fastrand::u64(0..=self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }
}

/// Fixed interval retry policy
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
    max_attempts: u32,
}

impl FixedInterval {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryPolicy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Final failure of a retried operation.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Retry executor
pub struct RetryExecutor<P: RetryPolicy> {
    policy: P,
}

impl<P: RetryPolicy> RetryExecutor<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    /// Execute an operation with retry logic. The closure receives the
    /// 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_counted(operation).await.map_err(|e| e.error)
    }

    /// Like `execute`, but reports how many attempts were made on failure.
    pub async fn execute_counted<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt, &error) {
                        warn!("Operation failed after {} attempts: {}", attempt, error);
                        return Err(RetryExhausted {
                            error,
                            attempts: attempt,
                        });
                    }

                    let delay = self.policy.delay(attempt);
                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, error
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff executor from configuration
pub fn exponential_backoff(config: RetryConfig) -> RetryExecutor<ExponentialBackoff> {
    RetryExecutor::new(ExponentialBackoff::new(config))
}

/// Fixed interval executor
pub fn fixed_interval(interval: Duration, max_attempts: u32) -> RetryExecutor<FixedInterval> {
    RetryExecutor::new(FixedInterval::new(interval, max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("Test error")]
    struct TestError;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_exponential_backoff_success_after_retries() {
        let executor = exponential_backoff(config(3));
        let attempt_count = Arc::new(AtomicU32::new(0));

        let counter = attempt_count.clone();
        let result = executor
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    let current = counter.fetch_add(1, Ordering::Relaxed);
                    if current < 2 {
                        Err(TestError)
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_match_max() {
        let executor = exponential_backoff(config(3));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log = seen.clone();
        let result: Result<(), _> = executor
            .execute_counted(move |attempt| {
                log.lock().unwrap().push(attempt);
                async { Err(TestError) }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ExponentialBackoff::new(RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 3000,
            multiplier: 2.0,
            jitter_ms: 0,
        });

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(3000));
        assert_eq!(policy.delay(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_fixed_interval() {
        let executor = fixed_interval(Duration::from_millis(10), 2);
        let attempt_count = Arc::new(AtomicU32::new(0));

        let counter = attempt_count.clone();
        let result: Result<(), TestError> = executor
            .execute(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err(TestError) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::Relaxed), 2);
    }
}
