//! Event source adapter
//!
//! Normalizes the two transports into one ordered stream of
//! [`PipelineEvent`]s for a single owner:
//!
//! - **direct**: a [`ChangeFeed`] subscription filtered by owner
//! - **bridged**: an HTTP streaming endpoint (see [`bridge`])
//!
//! Exactly one transport is opened per adapter. A configured bridge URL
//! always wins. Each subscription runs a single forwarding task, so events
//! reach the sink in the order the transport produced them.

pub mod backoff;
pub mod bridge;
pub mod change_feed;
pub mod envelope;

pub use change_feed::{ChangeFeed, ChangeKind, ChangeRecord, ChangeTable, MemoryChangeFeed};
pub use envelope::{BridgeEnvelope, EnvelopeError};

use crate::types::PipelineEvent;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum StreamError {
    Http(reqwest::Error),
    Status(u16),
    Feed(String),
    AlreadySubscribed,
    NoTransport,
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Http(err)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Http(e) => write!(f, "HTTP transport error: {}", e),
            StreamError::Status(code) => write!(f, "Bridged endpoint returned HTTP {}", code),
            StreamError::Feed(msg) => write!(f, "Change feed error: {}", msg),
            StreamError::AlreadySubscribed => write!(f, "Adapter already has an active subscription"),
            StreamError::NoTransport => write!(f, "Neither a change feed nor a bridge URL is configured"),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Bridged,
}

enum Transport {
    Direct(Arc<dyn ChangeFeed>),
    Bridged { client: reqwest::Client, url: String },
}

struct ActiveSubscription {
    gate: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct EventSourceAdapter {
    owner_id: String,
    transport: Transport,
    active: Mutex<Option<ActiveSubscription>>,
}

impl EventSourceAdapter {
    /// Build an adapter from whatever the host configured
    ///
    /// A bridge URL takes precedence; the feed is then never opened.
    pub fn new(
        owner_id: impl Into<String>,
        feed: Option<Arc<dyn ChangeFeed>>,
        bridge_url: Option<String>,
    ) -> Result<Self, StreamError> {
        let transport = match (bridge_url, feed) {
            (Some(url), _) => Transport::Bridged {
                client: build_stream_client()?,
                url,
            },
            (None, Some(feed)) => Transport::Direct(feed),
            (None, None) => return Err(StreamError::NoTransport),
        };

        Ok(Self {
            owner_id: owner_id.into(),
            transport,
            active: Mutex::new(None),
        })
    }

    pub fn direct(owner_id: impl Into<String>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            owner_id: owner_id.into(),
            transport: Transport::Direct(feed),
            active: Mutex::new(None),
        }
    }

    pub fn bridged(owner_id: impl Into<String>, url: impl Into<String>) -> Result<Self, StreamError> {
        Self::new(owner_id, None, Some(url.into()))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            Transport::Direct(_) => TransportKind::Direct,
            Transport::Bridged { .. } => TransportKind::Bridged,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|sub| sub.gate.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Open the configured transport and forward canonical events into `sink`
    ///
    /// Transport errors after this returns are logged and never close the
    /// subscription.
    pub async fn subscribe(&self, sink: mpsc::Sender<PipelineEvent>) -> Result<(), StreamError> {
        if self.is_active() {
            return Err(StreamError::AlreadySubscribed);
        }

        let gate = Arc::new(AtomicBool::new(true));
        let task = match &self.transport {
            Transport::Direct(feed) => {
                let rx = feed.subscribe(&self.owner_id).await?;
                log::info!("📡 Direct change feed subscribed for {}", self.owner_id);
                tokio::spawn(forward_changes(rx, self.owner_id.clone(), sink, gate.clone()))
            }
            Transport::Bridged { client, url } => tokio::spawn(bridge::run_bridge(
                client.clone(),
                url.clone(),
                self.owner_id.clone(),
                sink,
                gate.clone(),
            )),
        };

        let mut active = self.lock();
        if active.as_ref().map(|sub| sub.gate.load(Ordering::SeqCst)).unwrap_or(false) {
            gate.store(false, Ordering::SeqCst);
            task.abort();
            return Err(StreamError::AlreadySubscribed);
        }
        *active = Some(ActiveSubscription { gate, task });
        Ok(())
    }

    /// Close the active transport. No-op when nothing is subscribed.
    pub fn unsubscribe(&self) {
        let subscription = self.lock().take();
        if let Some(sub) = subscription {
            sub.gate.store(false, Ordering::SeqCst);
            sub.task.abort();
            log::info!("🔌 Event source unsubscribed for {}", self.owner_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSubscription>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EventSourceAdapter {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn build_stream_client() -> Result<reqwest::Client, StreamError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

async fn forward_changes(
    mut rx: change_feed::ChangeReceiver,
    owner_id: String,
    sink: mpsc::Sender<PipelineEvent>,
    gate: Arc<AtomicBool>,
) {
    while let Some(item) = rx.recv().await {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                log::warn!("⚠️  Change feed error (subscription kept): {}", e);
                continue;
            }
        };

        let event = match record.into_event() {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("Dropping malformed change row: {}", e);
                continue;
            }
        };

        if event.owner_id() != owner_id {
            log::debug!("Dropping cross-owner change for {}", event.owner_id());
            continue;
        }

        if !gate.load(Ordering::SeqCst) || sink.send(event).await.is_err() {
            break;
        }
    }

    log::debug!("Change feed forwarder for {} stopped", owner_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transaction_row(id: &str, owner: &str, amount: f64) -> serde_json::Value {
        json!({
            "id": id,
            "user_id": owner,
            "amount": amount,
            "category": "groceries",
            "transaction_date": "2024-03-10"
        })
    }

    #[tokio::test]
    async fn test_bridge_url_takes_precedence() {
        let feed: Arc<dyn ChangeFeed> = Arc::new(MemoryChangeFeed::default());
        let adapter =
            EventSourceAdapter::new("u1", Some(feed), Some("http://127.0.0.1:9/stream".to_string())).unwrap();
        assert_eq!(adapter.transport_kind(), TransportKind::Bridged);

        assert!(matches!(
            EventSourceAdapter::new("u1", None, None),
            Err(StreamError::NoTransport)
        ));
    }

    #[tokio::test]
    async fn test_direct_preserves_order_and_filters() {
        let feed = Arc::new(MemoryChangeFeed::default());
        let adapter = EventSourceAdapter::direct("u1", feed.clone());
        let (tx, mut rx) = mpsc::channel(16);
        adapter.subscribe(tx).await.unwrap();

        feed.publish("u1", ChangeRecord::insert(ChangeTable::Transactions, transaction_row("t1", "u1", 1.0)))
            .await;
        feed.publish("u1", ChangeRecord::insert(ChangeTable::Transactions, json!({"id": "broken"})))
            .await;
        feed.publish("u1", ChangeRecord::insert(ChangeTable::Transactions, transaction_row("t2", "u2", 2.0)))
            .await;
        feed.publish_error("u1", StreamError::Feed("socket reset".to_string())).await;
        feed.publish("u1", ChangeRecord::insert(ChangeTable::Transactions, transaction_row("t3", "u1", 3.0)))
            .await;

        let mut ids = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(PipelineEvent::Transaction(t)) => ids.push(t.id),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(ids, vec!["t1", "t3"]);
        assert!(adapter.is_active());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let feed = Arc::new(MemoryChangeFeed::default());
        let adapter = EventSourceAdapter::direct("u1", feed.clone());

        // Inactive: no-op
        adapter.unsubscribe();

        let (tx, mut rx) = mpsc::channel(16);
        adapter.subscribe(tx).await.unwrap();
        assert!(matches!(
            adapter.subscribe(mpsc::channel(1).0).await,
            Err(StreamError::AlreadySubscribed)
        ));

        adapter.unsubscribe();
        adapter.unsubscribe();
        assert!(!adapter.is_active());

        feed.publish("u1", ChangeRecord::insert(ChangeTable::Transactions, transaction_row("t1", "u1", 1.0)))
            .await;
        assert!(rx.recv().await.is_none());
    }
}
