//! Retry Logic
//!
//! Exponential backoff retry with jitter for refresh exchanges.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::core::CallContext;
use crate::error::{AuthError, RefreshError};
use crate::types::RefreshConfig;

/// Backoff schedule and retry classification for one refresh operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry and floor of every jittered delay.
    pub base_delay: Duration,
    /// Cap on the pre-jitter delay.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RefreshConfig::default())
    }
}

impl RetryPolicy {
    /// Build the policy from a refresh configuration snapshot.
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            multiplier: config.retry_multiplier,
            jitter: config.jitter_percent,
        }
    }

    /// Pre-jitter delay before retry number `retry` (1-based).
    ///
    /// `min(base * multiplier^(retry - 1), max)`; non-decreasing in `retry`.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let delay = (base * self.multiplier.powi(exponent)).min(max);
        Duration::try_from_secs_f64(delay.max(0.0))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before retry number `retry`, with uniform jitter applied.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.jittered(self.nominal_delay(retry), unit)
    }

    /// Apply jitter `unit` in [-1, 1] to `delay`, floored at the base delay.
    ///
    /// A perturbed delay too large for `Duration` saturates to `Duration::MAX`.
    pub fn jittered(&self, delay: Duration, unit: f64) -> Duration {
        let secs = delay.as_secs_f64();
        let perturbed = secs + secs * self.jitter * unit.clamp(-1.0, 1.0);
        Duration::try_from_secs_f64(perturbed.max(self.base_delay.as_secs_f64()))
            .unwrap_or(Duration::MAX)
    }

    /// Check if an error is worth another attempt.
    pub fn is_retryable(&self, error: &AuthError) -> bool {
        error.is_retryable()
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. `on_failure` observes
    /// every failed attempt. Cancellation of `ctx` ends the loop at once, also
    /// while sleeping between attempts, and is returned unchanged. Terminal
    /// errors are returned unchanged; exhausting the attempts yields
    /// [`RefreshError::RetriesExhausted`] wrapping the last error.
    pub async fn execute<T, F, Fut, O>(
        &self,
        ctx: &CallContext,
        mut operation: F,
        mut on_failure: O,
    ) -> Result<T, AuthError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
        O: FnMut(u32, &AuthError),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if let Some(error) = &last_error {
                let delay = self.backoff_delay(attempt - 1);
                debug!(
                    attempt = attempt - 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "refresh attempt failed, retrying"
                );
                ctx.sleep("refresh_backoff", delay).await?;
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) => {
                    on_failure(attempt, &error);
                    if !self.is_retryable(&error) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        let last_error = last_error.unwrap_or(AuthError::Refresh(RefreshError::Exchange {
            message: "no attempt was made".to_string(),
        }));
        Err(RefreshError::RetriesExhausted {
            attempts: max_attempts,
            last_error: Box::new(last_error),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    fn transient() -> AuthError {
        AuthError::Refresh(RefreshError::Transient {
            message: "HTTP 503".to_string(),
            status: Some(503),
        })
    }

    #[test]
    fn test_nominal_delay_monotonic_and_capped() {
        let policy = policy();
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(400));

        let mut previous = Duration::ZERO;
        for retry in 1..=40 {
            let delay = policy.nominal_delay(retry);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_floored_at_base() {
        let policy = policy();
        assert_eq!(
            policy.jittered(policy.base_delay, -1.0),
            policy.base_delay
        );
        for retry in 1..=10 {
            for _ in 0..50 {
                assert!(policy.backoff_delay(retry) >= policy.base_delay);
            }
        }
        let high = policy.jittered(Duration::from_secs(1), 1.0);
        assert!(high > Duration::from_millis(1099) && high <= Duration::from_millis(1101));
    }

    #[test]
    fn test_huge_max_delay_saturates() {
        let config = RefreshConfig {
            retry_max_delay: Duration::MAX,
            ..RefreshConfig::default()
        };
        assert!(config.validate().is_ok());

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.nominal_delay(1), config.retry_base_delay);
        assert!(policy.nominal_delay(64) < policy.max_delay);
        for retry in [70, 1_000, u32::MAX] {
            assert_eq!(policy.nominal_delay(retry), policy.max_delay);
            assert!(policy.backoff_delay(retry) >= policy.base_delay);
        }
        assert_eq!(policy.jittered(Duration::MAX, 1.0), Duration::MAX);
        assert!(policy.jittered(Duration::MAX, -1.0) >= policy.base_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let failures = AtomicU32::new(0);

        let result = policy()
            .execute(
                &CallContext::new(),
                |_attempt| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(transient())
                        } else {
                            Ok("token")
                        }
                    }
                },
                |_, _| {
                    failures.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_exhausts_attempts() {
        let result: Result<(), _> = policy()
            .execute(&CallContext::new(), |_| async { Err(transient()) }, |_, _| {})
            .await;

        match result {
            Err(AuthError::Refresh(RefreshError::RetriesExhausted {
                attempts,
                last_error,
            })) => {
                assert_eq!(attempts, 3);
                assert!(last_error.to_string().contains("503"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy()
            .execute(
                &CallContext::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(AuthError::Refresh(RefreshError::Terminal {
                            message: "invalid_grant".to_string(),
                            status: Some(400),
                        }))
                    }
                },
                |_, _| {},
            )
            .await;

        assert!(matches!(
            result,
            Err(AuthError::Refresh(RefreshError::Terminal { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_cancelled_during_backoff() {
        let ctx = CallContext::new();
        let slow = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..policy()
        };

        let canceller = ctx.clone();
        let result: Result<(), _> = slow
            .execute(
                &ctx,
                |_| {
                    canceller.cancel();
                    async { Err(transient()) }
                },
                |_, _| {},
            )
            .await;

        assert!(matches!(
            result,
            Err(AuthError::Cancelled {
                operation: "refresh_backoff"
            })
        ));
    }
}
