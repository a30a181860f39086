//! Direct transport: row-level change subscription
//!
//! A [`ChangeFeed`] delivers full rows for one owner. The adapter decides
//! which changes matter:
//! - transactions: inserts only
//! - budgets: any change carrying a row
//! - documents: updates where `processed` goes false -> true
//! - notifications / analytics: inserts and updates

use super::envelope::{EnvelopeError, RawBudget, RawDocument, RawTransaction};
use super::StreamError;
use crate::types::{AnalyticsEvent, Notification, PipelineEvent};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTable {
    Transactions,
    Budgets,
    Documents,
    Notifications,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change as emitted by the backing store
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: ChangeTable,
    pub kind: ChangeKind,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl ChangeRecord {
    pub fn insert(table: ChangeTable, row: Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            old: None,
            new: Some(row),
        }
    }

    pub fn update(table: ChangeTable, old: Value, new: Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    /// Map the change to a canonical event
    ///
    /// `Ok(None)` means the change is irrelevant; `Err` means the row was malformed.
    pub fn into_event(self) -> Result<Option<PipelineEvent>, EnvelopeError> {
        let row = match self.new {
            Some(row) => row,
            None => return Ok(None),
        };

        let event = match (self.table, self.kind) {
            (ChangeTable::Transactions, ChangeKind::Insert) => {
                PipelineEvent::Transaction(serde_json::from_value::<RawTransaction>(row)?.validate()?)
            }
            (ChangeTable::Transactions, _) => return Ok(None),
            (ChangeTable::Budgets, _) => {
                PipelineEvent::Budget(serde_json::from_value::<RawBudget>(row)?.validate()?)
            }
            (ChangeTable::Documents, ChangeKind::Update) => {
                let was_processed = self
                    .old
                    .as_ref()
                    .and_then(|old| old.get("processed"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let document: RawDocument = serde_json::from_value(row)?;
                if was_processed || !document.processed {
                    return Ok(None);
                }
                PipelineEvent::DocumentProcessed(document.into_event())
            }
            (ChangeTable::Documents, _) => return Ok(None),
            (ChangeTable::Notifications, ChangeKind::Delete) | (ChangeTable::Analytics, ChangeKind::Delete) => {
                return Ok(None)
            }
            (ChangeTable::Notifications, _) => {
                PipelineEvent::Notification(serde_json::from_value::<Notification>(row)?)
            }
            (ChangeTable::Analytics, _) => {
                PipelineEvent::Analytics(serde_json::from_value::<AnalyticsEvent>(row)?)
            }
        };
        Ok(Some(event))
    }
}

pub type ChangeReceiver = mpsc::Receiver<Result<ChangeRecord, StreamError>>;

/// Per-owner change subscription on the backing store
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription filtered to `owner_id`. Dropping the receiver closes it.
    async fn subscribe(&self, owner_id: &str) -> Result<ChangeReceiver, StreamError>;
}

/// In-process change feed. Hosts that receive row changes from elsewhere
/// push them in with [`MemoryChangeFeed::publish`].
pub struct MemoryChangeFeed {
    buffer: usize,
    subscribers: Mutex<Vec<(String, mpsc::Sender<Result<ChangeRecord, StreamError>>)>>,
}

impl MemoryChangeFeed {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a change to every open subscription for `owner_id`
    pub async fn publish(&self, owner_id: &str, record: ChangeRecord) {
        self.send(owner_id, Ok(record)).await;
    }

    /// Surface a transport error to subscribers for `owner_id`
    pub async fn publish_error(&self, owner_id: &str, error: StreamError) {
        self.send(owner_id, Err(error)).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    async fn send(&self, owner_id: &str, item: Result<ChangeRecord, StreamError>) {
        let targets: Vec<_> = {
            let mut subscribers = self.lock();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(owner, _)| owner == owner_id)
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        for tx in targets {
            let item = match &item {
                Ok(record) => Ok(record.clone()),
                Err(e) => Err(StreamError::Feed(e.to_string())),
            };
            let _ = tx.send(item).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, mpsc::Sender<Result<ChangeRecord, StreamError>>)>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, owner_id: &str) -> Result<ChangeReceiver, StreamError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().push((owner_id.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(processed: bool) -> Value {
        json!({"id": "d1", "user_id": "u1", "processed": processed, "file_name": "receipt.jpg"})
    }

    #[test]
    fn test_only_processed_transition_is_relevant() {
        let became_processed = ChangeRecord::update(ChangeTable::Documents, document(false), document(true));
        assert!(matches!(
            became_processed.into_event(),
            Ok(Some(PipelineEvent::DocumentProcessed(_)))
        ));

        let already_processed = ChangeRecord::update(ChangeTable::Documents, document(true), document(true));
        assert_eq!(already_processed.into_event(), Ok(None));

        let still_pending = ChangeRecord::update(ChangeTable::Documents, document(false), document(false));
        assert_eq!(still_pending.into_event(), Ok(None));
    }

    #[test]
    fn test_transaction_updates_ignored() {
        let row = json!({
            "id": "t1", "user_id": "u1", "amount": 5, "category": "dining", "transaction_date": "2024-01-01"
        });
        let update = ChangeRecord::update(ChangeTable::Transactions, row.clone(), row.clone());
        assert_eq!(update.into_event(), Ok(None));

        let insert = ChangeRecord::insert(ChangeTable::Transactions, row);
        assert!(matches!(insert.into_event(), Ok(Some(PipelineEvent::Transaction(_)))));
    }

    #[tokio::test]
    async fn test_memory_feed_filters_by_owner() {
        let feed = MemoryChangeFeed::default();
        let mut rx_u1 = feed.subscribe("u1").await.unwrap();
        let mut rx_u2 = feed.subscribe("u2").await.unwrap();

        feed.publish("u1", ChangeRecord::insert(ChangeTable::Budgets, json!({}))).await;

        assert!(rx_u1.try_recv().is_ok());
        assert!(rx_u2.try_recv().is_err());

        drop(rx_u1);
        feed.publish("u1", ChangeRecord::insert(ChangeTable::Budgets, json!({}))).await;
        assert_eq!(feed.subscriber_count(), 1);
    }
}
