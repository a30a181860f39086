//! Resilient external calls
//!
//! - `retry` - bounded exponential backoff with jitter
//! - `circuit_breaker` - per-service CLOSED/OPEN/HALF_OPEN gate
//! - `registry` - one breaker + retry policy per service key
//! - `error` - the call failure taxonomy

pub mod circuit_breaker;
pub mod error;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitSnapshot};
pub use error::CallError;
pub use registry::BreakerRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
