//! Derived signals: anomalies, budget alerts and their fan-out

pub mod anomaly;
pub mod budget_monitor;
pub mod dispatcher;
pub mod registry;

pub use anomaly::AnomalyDetector;
pub use budget_monitor::BudgetMonitor;
pub use dispatcher::{AlertDispatcher, RecentAlerts};
pub use registry::{SubscriberRegistry, Subscription};
