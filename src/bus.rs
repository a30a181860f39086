//! Message bus seam
//!
//! Workflows publish responses and one-way events by topic name. The broker
//! itself lives outside this crate; [`ChannelBus`] is the in-process
//! implementation used by the host binary and tests.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum BusError {
    Serialization(serde_json::Error),
    Closed(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Serialization(e) => write!(f, "Failed to serialize bus message: {}", e),
            BusError::Closed(topic) => write!(f, "Bus closed while publishing to {}", topic),
        }
    }
}

impl std::error::Error for BusError {}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;
}

/// Serialize `message` and publish it on `topic`
pub async fn publish_json<M: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    topic: &str,
    message: &M,
) -> Result<(), BusError> {
    let payload = serde_json::to_value(message)?;
    bus.publish(topic, payload).await
}

/// mpsc-backed bus; the receiver half gets every published message in order
#[derive(Clone)]
pub struct ChannelBus {
    tx: mpsc::Sender<BusMessage>,
}

impl ChannelBus {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        log::debug!("📤 {} <- {}", topic, payload);
        self.tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| BusError::Closed(topic.to_string()))
    }
}
