//! transaction-ingest: persist → notify → analyze

use super::{IngestRequest, Step, WorkflowName, WorkflowOrchestrator, WorkflowRun, WorkflowStepError};
use crate::resilience::CallError;
use crate::types::{month_key, AnalyticsEvent, AnomalyResult, BudgetAlert, Notification, Transaction};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub correlation_id: String,
    pub transaction: Transaction,
    pub anomaly: Option<AnomalyResult>,
    pub alert: Option<BudgetAlert>,
}

impl WorkflowOrchestrator {
    /// Persist one transaction, publish its signals, then update analytics
    ///
    /// The persisted row is published on the transactions topic so it
    /// re-enters the event stream. Signal evaluation failures are logged and
    /// treated as no signal; they do not fail the run.
    pub async fn ingest_transaction(&self, request: IngestRequest) -> Result<IngestOutcome, WorkflowStepError> {
        let mut run = WorkflowRun::start(WorkflowName::TransactionIngest, request.correlation_id.clone());
        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => return Err(run.failure(Step::Persist, CallError::Cancelled)),
        };

        let transaction = run.step(Step::Persist, self.persist_transaction(&request)).await?;
        let (anomaly, alert) = run.step(Step::Notify, self.notify_signals(&transaction)).await?;
        run.step(Step::Analyze, self.record_analytics(&transaction)).await?;
        run.finish();

        Ok(IngestOutcome {
            correlation_id: run.correlation_id,
            transaction,
            anomaly,
            alert,
        })
    }

    async fn persist_transaction(&self, request: &IngestRequest) -> Result<Transaction, CallError> {
        if request.owner_id.trim().is_empty() {
            return Err(CallError::Validation("user_id is required".to_string()));
        }
        if !request.draft.amount.is_finite() || request.draft.amount < 0.0 {
            return Err(CallError::Validation(format!("invalid amount: {}", request.draft.amount)));
        }

        let store = &self.store;
        let owner_id = request.owner_id.as_str();
        let drafts = std::slice::from_ref(&request.draft);
        let document_id = request.document_id.as_deref();

        let inserted = self
            .store_call(move || async move {
                store
                    .insert_transactions(owner_id, drafts, document_id)
                    .await
                    .map_err(CallError::from)
            })
            .await?;
        let transaction = inserted
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Permanent("store returned no inserted row".to_string()))?;

        self.publish_step(&self.topics.transactions, &transaction).await?;
        Ok(transaction)
    }

    /// Evaluate anomaly and budget signals and publish them as notifications
    pub(super) async fn notify_signals(
        &self,
        transaction: &Transaction,
    ) -> Result<(Option<AnomalyResult>, Option<BudgetAlert>), CallError> {
        let detector = &self.detector;
        let monitor = &self.monitor;

        let anomaly = match self
            .store_call(move || async move { detector.evaluate(transaction).await.map_err(CallError::from) })
            .await
        {
            Ok(result) if result.is_anomaly => Some(result),
            Ok(_) => None,
            Err(e) => {
                log::warn!("⚠️  Anomaly evaluation failed for {} (no signal): {}", transaction.id, e);
                None
            }
        };

        let alert = match self
            .store_call(move || async move { monitor.evaluate(transaction).await.map_err(CallError::from) })
            .await
        {
            Ok(alert) => alert,
            Err(e) => {
                log::warn!("⚠️  Budget evaluation failed for {} (no signal): {}", transaction.id, e);
                None
            }
        };

        let notifications = anomaly
            .iter()
            .map(Notification::from)
            .chain(alert.iter().map(Notification::from));
        for notification in notifications {
            log::info!("🔔 {}: {}", notification.title, notification.message);
            self.publish_step(&self.topics.notifications, &notification).await?;
        }

        Ok((anomaly, alert))
    }

    /// Per-transaction upsert of the derived spending tables, keyed by the
    /// transaction's own month
    pub(super) async fn record_analytics(&self, transaction: &Transaction) -> Result<(), CallError> {
        let store = &self.store;
        let period = month_key(transaction.date);
        let period_ref = period.as_str();

        self.store_call(move || async move {
            store
                .record_spending(&transaction.owner_id, transaction.category, period_ref, transaction.amount)
                .await
                .map_err(CallError::from)
        })
        .await?;

        let event = AnalyticsEvent {
            owner_id: transaction.owner_id.clone(),
            event_type: "transaction_added".to_string(),
            period,
            category: Some(transaction.category),
            amount: transaction.amount,
        };
        self.publish_step(&self.topics.analytics, &event).await
    }
}
