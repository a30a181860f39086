//! External service seams
//!
//! Workflows reach the completion and OCR services only through these traits.
//! Implementations report failures as [`CallError`]s so the breaker and retry
//! layers can classify them.

pub mod gateway;
pub mod sse;

pub use gateway::{GatewayCompletionClient, GatewayOcrClient};

use crate::resilience::CallError;
use crate::store::ChatMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Prompt plus prior conversation, oldest first
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub history: Vec<ChatMessage>,
}

impl CompletionRequest {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Full response text
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CallError>;

    /// Forward text fragments into `chunks` until the end-of-stream marker
    ///
    /// Returns [`CallError::Cancelled`] if the receiver is dropped.
    async fn stream(&self, request: &CompletionRequest, chunks: mpsc::Sender<String>) -> Result<(), CallError>;
}

#[async_trait]
pub trait OcrService: Send + Sync {
    /// Extracted text, or `None` when the document yielded no text
    async fn extract_text(&self, document_url: &str) -> Result<Option<String>, CallError>;
}
