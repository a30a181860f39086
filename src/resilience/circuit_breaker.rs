//! Circuit breaker for one external service key
//!
//! ```text
//!   CLOSED --(consecutive failures >= threshold)--> OPEN
//!   OPEN   --(recovery timeout elapsed)-----------> HALF_OPEN (one trial call)
//!   HALF_OPEN --success--> CLOSED (counter reset)
//!   HALF_OPEN --failure--> OPEN   (timeout restarts)
//! ```
//!
//! All transitions happen under one mutex per breaker, so concurrent
//! workflows calling the same dependency never race on the counter. The
//! lock is never held across an await.

use super::error::CallError;
use crate::config::{ServiceConfig, ServiceKey};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Point-in-time copy of a breaker's state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: ServiceKey,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(key: ServiceKey, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            key,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(CircuitState {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(key: ServiceKey, config: &ServiceConfig) -> Self {
        Self::new(key, config.failure_threshold, config.recovery_timeout)
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Run `op` if the breaker admits it, then record the outcome
    ///
    /// Returns [`CallError::CircuitOpen`] without invoking `op` while open
    /// (or while another caller holds the half-open trial).
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut admission = self.admit()?;
        let result = op().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(err) if err.counts_against_breaker() => self.record_failure(),
            Err(_) => {}
        }
        admission.settle();

        result
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Result<Admission<'_>, CallError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::new(self, false)),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(CallError::CircuitOpen(self.key));
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                log::info!("🔌 Circuit {} transitioning to HALF_OPEN", self.key);
                Ok(Admission::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CallError::CircuitOpen(self.key));
                }
                inner.trial_in_flight = true;
                Ok(Admission::new(self, true))
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            log::info!("✅ Circuit {} CLOSED after successful trial", self.key);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                log::warn!("⚠️  Circuit {} re-OPENED after failed trial", self.key);
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                log::warn!(
                    "⚠️  Circuit {} OPEN after {} consecutive failures",
                    self.key,
                    inner.consecutive_failures
                );
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
    }
}

/// Held while an admitted call runs. Frees the half-open trial slot if the
/// call future is dropped before it reports an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self { breaker, trial }
    }

    fn settle(&mut self) {
        if self.trial {
            self.breaker.release_trial();
            self.trial = false;
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CallError> {
        breaker
            .call(|| async { Err::<(), _>(CallError::Transient("500".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CallError> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(ServiceKey::Ocr, 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result = breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(CallError::CircuitOpen(ServiceKey::Ocr)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new(ServiceKey::Completion, 2, Duration::from_secs(30));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(succeed(&breaker).await.is_ok());
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timeout() {
        let breaker = CircuitBreaker::new(ServiceKey::Store, 1, Duration::from_secs(15));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(16)).await;

        fail(&breaker).await.ok();
        assert_eq!(breaker.snapshot().state, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(succeed(&breaker).await, Err(CallError::CircuitOpen(ServiceKey::Store)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_half_open() {
        let breaker = Arc::new(CircuitBreaker::new(ServiceKey::Ocr, 1, Duration::from_secs(60)));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(61)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    release_rx.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;

        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
        assert_eq!(succeed(&breaker).await, Err(CallError::CircuitOpen(ServiceKey::Ocr)));

        release_tx.send(()).ok();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_counter_while_closed() {
        let breaker = CircuitBreaker::new(ServiceKey::Completion, 3, Duration::from_secs(30));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.ok();
        fail(&breaker).await.ok();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_validation_and_cancel_not_counted() {
        let breaker = CircuitBreaker::new(ServiceKey::Completion, 1, Duration::from_secs(30));
        let _ = breaker
            .call(|| async { Err::<(), _>(CallError::Validation("bad".to_string())) })
            .await;
        let _ = breaker.call(|| async { Err::<(), _>(CallError::Cancelled) }).await;

        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }
}
