//! spendstream: real-time personal finance event processing
//!
//! - `stream` - event source adapter (direct change feed or bridged HTTP stream)
//! - `signals` - anomaly detection, budget thresholds, listener fan-out
//! - `pipeline` - adapter → consumer loop → dispatcher wiring for one owner
//! - `resilience` - circuit breakers and retry around every external call
//! - `workflow` - multi-step request workflows (ingest, OCR, budget, chat)
//! - `store` - ledger persistence (SQLite)
//! - `clients` - completion and OCR gateway clients
//! - `bus` - outbound message bus seam

pub mod bus;
pub mod clients;
pub mod config;
pub mod pipeline;
pub mod resilience;
pub mod signals;
pub mod store;
pub mod stream;
pub mod types;
pub mod workflow;

pub use config::{CoreConfig, ResilienceConfig, ServiceConfig, ServiceKey, Topics};
pub use pipeline::FinancePipeline;
pub use resilience::{BreakerRegistry, CallError};
pub use signals::{AlertDispatcher, AnomalyDetector, BudgetMonitor};
pub use store::{LedgerStore, SqliteLedgerStore};
pub use stream::EventSourceAdapter;
pub use types::*;
pub use workflow::{Collaborators, WorkflowOrchestrator};
