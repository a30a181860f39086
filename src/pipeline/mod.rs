//! Real-time finance event pipeline
//!
//! ```text
//! ChangeFeed / bridge ──► EventSourceAdapter ──mpsc──► run_ingestion ──► AlertDispatcher ──► listeners
//!                                                          │
//!                                                          └─ AnomalyDetector, BudgetMonitor
//! ```
//!
//! One pipeline serves one owner. Listeners are registered on the shared
//! [`AlertDispatcher`] before or after [`FinancePipeline::start`].

pub mod ingestion;

pub use ingestion::{run_ingestion, IngestionStats};

use crate::signals::{AlertDispatcher, Subscription};
use crate::store::LedgerStore;
use crate::stream::{EventSourceAdapter, StreamError};
use crate::types::{AnomalyResult, BudgetAlert, Notification, Transaction};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events buffered between the adapter and the consumer loop
pub const EVENT_CHANNEL_BUFFER: usize = 1024;

pub struct FinancePipeline {
    adapter: EventSourceAdapter,
    store: Arc<dyn LedgerStore>,
    dispatcher: Arc<AlertDispatcher>,
    buffer: usize,
    ingestion: Option<JoinHandle<IngestionStats>>,
}

impl FinancePipeline {
    pub fn new(adapter: EventSourceAdapter, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            adapter,
            store,
            dispatcher: Arc::new(AlertDispatcher::new()),
            buffer: EVENT_CHANNEL_BUFFER,
            ingestion: None,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    pub fn adapter(&self) -> &EventSourceAdapter {
        &self.adapter
    }

    pub fn is_running(&self) -> bool {
        self.ingestion.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Subscribe the adapter and spawn the consumer loop
    pub async fn start(&mut self) -> Result<(), StreamError> {
        if self.is_running() {
            return Err(StreamError::AlreadySubscribed);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.adapter.subscribe(tx).await?;
        self.ingestion = Some(tokio::spawn(run_ingestion(
            rx,
            self.store.clone(),
            self.dispatcher.clone(),
        )));

        log::info!("✅ Finance pipeline started for {}", self.adapter.owner_id());
        Ok(())
    }

    /// Close the transport, drain the consumer loop and drop every listener
    ///
    /// Returns the loop's counters when it was running.
    pub async fn shutdown(&mut self) -> Option<IngestionStats> {
        self.adapter.unsubscribe();

        let stats = match self.ingestion.take() {
            Some(handle) => match handle.await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    log::error!("❌ Ingestion task failed: {}", e);
                    None
                }
            },
            None => None,
        };

        self.dispatcher.clear();
        log::info!("🛑 Finance pipeline stopped for {}", self.adapter.owner_id());
        stats
    }

    pub fn add_transaction_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        self.dispatcher.add_transaction_listener(f)
    }

    pub fn add_anomaly_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&AnomalyResult) + Send + Sync + 'static,
    {
        self.dispatcher.add_anomaly_listener(f)
    }

    pub fn add_budget_alert_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&BudgetAlert) + Send + Sync + 'static,
    {
        self.dispatcher.add_budget_alert_listener(f)
    }

    pub fn add_notification_listener<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.dispatcher.add_notification_listener(f)
    }

    /// Newest budget alert per category, newest first
    pub fn recent_alerts(&self) -> Vec<BudgetAlert> {
        self.dispatcher.recent_alerts()
    }
}
