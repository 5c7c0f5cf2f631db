//! Bounded retries with exponential backoff
//!
//! [`RetryHandler::retry_with_cancellation`] drives an async operation until it
//! succeeds, fails with a non-retryable classified error, or runs out of
//! attempts. Every attempt and every backoff sleep races the caller's
//! [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::classifier::Classify;
use crate::error::{DatabaseError, DbResult};

/// Retry policy in configuration form (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; 0 disables retry
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomize each delay between 50% and 100% of its computed value
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(DatabaseError::configuration(format!(
                "retry max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ))
            .with_field("retry.max_delay_ms"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(DatabaseError::configuration(format!(
                "retry backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ))
            .with_field("retry.backoff_multiplier"));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Runtime retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Attempts actually performed; never less than one
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

/// Executes operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or retrying stops
    ///
    /// The token is checked before every attempt; a cancelled token returns
    /// a `Cancelled` error without invoking `operation`. Failures are
    /// classified and only retryable ones are retried. The returned error
    /// carries the number of retries performed and the last delay.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use acton_data::retry::{RetryHandler, RetryPolicy};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn example() -> acton_data::error::DbResult<()> {
    /// let handler = RetryHandler::new(RetryPolicy::default());
    /// let token = CancellationToken::new();
    /// let value = handler
    ///     .retry_with_cancellation(&token, "ping", || async { Ok::<_, sqlx::Error>(1) })
    ///     .await?;
    /// assert_eq!(value, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn retry_with_cancellation<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        mut operation: F,
    ) -> DbResult<T>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.effective_attempts();
        let mut last_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(finish(DatabaseError::cancelled(name), attempt, last_delay));
            }

            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e.classify(name),
            };

            if !error.retryable || attempt >= max_attempts {
                return Err(finish(error, attempt - 1, last_delay));
            }

            let delay = self.policy.jittered(self.policy.delay_for_attempt(attempt));
            last_delay = delay;

            tracing::warn!(
                operation = name,
                attempt,
                max_attempts,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable database error, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(finish(DatabaseError::cancelled(name), attempt, last_delay));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn finish(mut error: DatabaseError, retries: u32, delay: Duration) -> DatabaseError {
    error.retry_count = retries;
    error.retry_delay = delay;
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let handler = RetryHandler::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let result = handler
            .retry_with_cancellation(&token, "create", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("connection refused")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_stops_after_max_attempts() {
        let handler = RetryHandler::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let error = handler
            .retry_with_cancellation(&token, "create", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("deadlock detected")
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.kind, ErrorKind::Deadlock);
        assert_eq!(error.operation, "create");
        assert_eq!(error.retry_count, 2);
        assert!(error.retry_delay <= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_operation() {
        let handler = RetryHandler::new(fast_policy(3));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let error = handler
            .retry_with_cancellation(&token, "count_all", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(error.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let handler = RetryHandler::new(fast_policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let error = handler
            .retry_with_cancellation(&token, "create", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("UNIQUE constraint failed: widgets.sku")
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.kind, ErrorKind::Duplicate);
        assert_eq!(error.retry_count, 0);
    }

    #[tokio::test]
    async fn test_zero_attempts_means_single_attempt() {
        let handler = RetryHandler::new(fast_policy(0));
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let _ = handler
            .retry_with_cancellation(&token, "create", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection reset by peer")
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let handler = RetryHandler::new(policy);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let error = handler
            .retry_with_cancellation(&token, "update", || async {
                Err::<(), _>("connection refused")
            })
            .await
            .unwrap_err();

        assert_eq!(error.kind, ErrorKind::Cancelled);
        assert_eq!(error.retry_count, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = fast_policy(3);
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let delay = policy.jittered(base);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= base);
        }
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let config = RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..Default::default()
        };
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Configuration);
    }
}
