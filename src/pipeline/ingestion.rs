//! Event consumer loop: raw fan-out plus per-transaction signal evaluation

use crate::signals::{AlertDispatcher, AnomalyDetector, BudgetMonitor};
use crate::store::LedgerStore;
use crate::types::{PipelineEvent, Transaction};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub events: u64,
    pub transactions: u64,
    pub anomalies: u64,
    pub budget_alerts: u64,
    pub evaluation_errors: u64,
}

/// Consume canonical events until the channel closes
///
/// For every event:
/// 1. Deliver it to the listeners registered for its type
/// 2. For transactions, score it for anomalies and check it against the
///    active budget, dispatching any resulting signal
///
/// Evaluation failures are logged and treated as no signal.
///
/// Arguments:
/// - `rx`: Receiver fed by the event source adapter
/// - `store`: Ledger the detector and monitor read from
/// - `dispatcher`: Listener fan-out shared with the host
pub async fn run_ingestion(
    mut rx: mpsc::Receiver<PipelineEvent>,
    store: Arc<dyn LedgerStore>,
    dispatcher: Arc<AlertDispatcher>,
) -> IngestionStats {
    log::info!("🚀 Starting event ingestion");
    log::info!("   └─ Waiting for events...");

    let detector = AnomalyDetector::new(store.clone());
    let monitor = BudgetMonitor::new(store);
    let mut stats = IngestionStats::default();
    let mut stats_timer = interval(STATS_INTERVAL);
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_timer.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => {
                        log::warn!("⚠️  Event channel closed, stopping ingestion");
                        break;
                    }
                };

                stats.events += 1;
                dispatcher.dispatch_event(&event);
                if let PipelineEvent::Transaction(transaction) = &event {
                    stats.transactions += 1;
                    evaluate_transaction(transaction, &detector, &monitor, &dispatcher, &mut stats).await;
                }
            }

            _ = stats_timer.tick() => {
                log::info!(
                    "📊 Ingestion: {} events ({} transactions) | {} anomalies | {} budget alerts",
                    stats.events, stats.transactions, stats.anomalies, stats.budget_alerts
                );
            }
        }
    }

    log::info!("✅ Event ingestion stopped ({} events)", stats.events);
    stats
}

async fn evaluate_transaction(
    transaction: &Transaction,
    detector: &AnomalyDetector,
    monitor: &BudgetMonitor,
    dispatcher: &AlertDispatcher,
    stats: &mut IngestionStats,
) {
    match detector.evaluate(transaction).await {
        Ok(result) if result.is_anomaly => {
            log::info!(
                "🚨 Anomaly ({:?}) on {}: {}",
                result.severity,
                transaction.id,
                result.reason
            );
            stats.anomalies += 1;
            dispatcher.dispatch_anomaly(&result);
        }
        Ok(_) => {}
        Err(e) => {
            log::warn!("⚠️  Anomaly evaluation failed for {}: {}", transaction.id, e);
            stats.evaluation_errors += 1;
        }
    }

    match monitor.evaluate(transaction).await {
        Ok(Some(alert)) => {
            log::info!("💰 {}", alert.message());
            stats.budget_alerts += 1;
            dispatcher.dispatch_budget_alert(&alert);
        }
        Ok(None) => {}
        Err(e) => {
            log::warn!("⚠️  Budget evaluation failed for {}: {}", transaction.id, e);
            stats.evaluation_errors += 1;
        }
    }
}
