//! Breaker + retry policy per service key
//!
//! One registry is built by whoever composes the orchestrator and passed
//! around as `Arc<BreakerRegistry>`. Every guarded call goes through
//! [`BreakerRegistry::call`], which is `CircuitBreaker(RetryExecutor(op))`:
//! the breaker admits the call once, the executor retries inside it, and only
//! the terminal outcome is counted.

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use super::error::CallError;
use super::retry::RetryExecutor;
use crate::config::{ResilienceConfig, ServiceKey};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

struct GuardedService {
    breaker: CircuitBreaker,
    retry: RetryExecutor,
}

pub struct BreakerRegistry {
    services: HashMap<ServiceKey, Arc<GuardedService>>,
}

impl BreakerRegistry {
    pub fn new(config: &ResilienceConfig) -> Self {
        let services = ServiceKey::all()
            .into_iter()
            .map(|key| {
                let service = config.service(key);
                log::debug!(
                    "🛡️  {}: threshold={} recovery={:?} attempts={}",
                    key,
                    service.failure_threshold,
                    service.recovery_timeout,
                    service.retry.max_attempts
                );
                let guarded = GuardedService {
                    breaker: CircuitBreaker::from_config(key, &service),
                    retry: RetryExecutor::new(key.as_str(), service.retry.clone()),
                };
                (key, Arc::new(guarded))
            })
            .collect();

        Self { services }
    }

    /// Run `op` against `key` with breaker and retry protection
    pub async fn call<T, F, Fut>(&self, key: ServiceKey, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let service = self.service(key)?;
        service
            .breaker
            .call(|| service.retry.execute(op))
            .await
    }

    pub fn snapshot(&self, key: ServiceKey) -> Option<CircuitSnapshot> {
        self.services.get(&key).map(|s| s.breaker.snapshot())
    }

    fn service(&self, key: ServiceKey) -> Result<Arc<GuardedService>, CallError> {
        self.services
            .get(&key)
            .cloned()
            .ok_or_else(|| CallError::Validation(format!("no breaker registered for {}", key)))
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(&ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::resilience::circuit_breaker::BreakerState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once() {
        let registry = BreakerRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = registry
            .call(ServiceKey::Ocr, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::Transient("500".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = registry.snapshot(ServiceKey::Ocr).unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_are_isolated() {
        let config = ResilienceConfig::default().with_service(
            ServiceKey::Ocr,
            ServiceConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                retry: Default::default(),
            },
        );
        let registry = BreakerRegistry::new(&config);

        let _: Result<(), _> = registry
            .call(ServiceKey::Ocr, || async { Err(CallError::Permanent("400".to_string())) })
            .await;

        assert_eq!(registry.snapshot(ServiceKey::Ocr).unwrap().state, BreakerState::Open);
        assert_eq!(
            registry.snapshot(ServiceKey::Completion).unwrap().state,
            BreakerState::Closed
        );
        let ok = registry.call(ServiceKey::Completion, || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }
}
