//! Exponential backoff with jitter

use super::error::CallError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Immutable retry settings for one service key
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_factor: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_factor: 2.0,
            jitter_fraction: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(max_delay, base * factor^(attempt-1))`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay. `sample` is uniform in `[-1, 1]`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let jittered = nominal * (1.0 + self.jitter_fraction * sample.clamp(-1.0, 1.0));
        let capped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_sample(attempt, sample)
    }
}

/// Runs one dependency call with bounded retry
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    label: String,
}

impl RetryExecutor {
    pub fn new(label: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            policy,
            label: label.into(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op`, retrying transient failures
    ///
    /// Validation failures, permanent failures and cancellations return
    /// immediately. After `max_attempts` the last transient error is returned.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    if attempt >= max_attempts {
                        log::warn!(
                            "❌ {}: giving up after {} attempts: {}",
                            self.label,
                            attempt,
                            err
                        );
                        return Err(err);
                    }

                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "⏳ {}: attempt {} of {} failed ({}), retrying in {:.2}s",
                        self.label,
                        attempt,
                        max_attempts,
                        err,
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_nominal_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=6 {
            let nominal = policy.nominal_delay(attempt).as_secs_f64();
            let low = (nominal * 0.5).min(30.0);
            let high = (nominal * 1.5).min(30.0);

            assert!((policy.delay_with_sample(attempt, -1.0).as_secs_f64() - low).abs() < 1e-9);
            assert!((policy.delay_with_sample(attempt, 1.0).as_secs_f64() - high).abs() < 1e-9);

            for _ in 0..50 {
                let d = policy.delay(attempt).as_secs_f64();
                assert!(d >= low - 1e-9 && d <= high + 1e-9, "attempt {} delay {}", attempt, d);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let executor = RetryExecutor::new("test", RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(CallError::Transient("503".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let executor = RetryExecutor::new("test", RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), CallError> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::Transient("500".to_string()))
                }
            })
            .await;

        assert_eq!(result, Err(CallError::Transient("500".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_never_retried() {
        let executor = RetryExecutor::new("test", RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), CallError> = executor
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::Validation("income must be > 0".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(CallError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
