//! Request and response messages exchanged over the bus
//!
//! Requests accept both camelCase and snake_case field names. Every response
//! echoes the request's correlation id.

use super::{Step, WorkflowName};
use crate::types::{Category, TransactionDraft};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestRequest {
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(alias = "userId", alias = "user_id")]
    pub owner_id: String,
    #[serde(flatten)]
    pub draft: TransactionDraft,
    #[serde(default, alias = "documentId")]
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OcrRequest {
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(alias = "userId", alias = "user_id")]
    pub owner_id: String,
    #[serde(alias = "documentId")]
    pub document_id: String,
    #[serde(alias = "fileUrl")]
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BudgetRequest {
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(alias = "userId", alias = "user_id")]
    pub owner_id: String,
    #[serde(default, alias = "totalIncome")]
    pub total_income: Option<f64>,
    #[serde(default)]
    pub period: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequest {
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(alias = "userId", alias = "user_id")]
    pub owner_id: String,
    pub message: String,
}

/// Terminal response for request/response workflows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub correlation_id: String,
    pub workflow: WorkflowName,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Step>,
    pub completed_steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSuggestion {
    pub suggestion: BTreeMap<Category, f64>,
    pub total_income: f64,
    pub period: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrOutcome {
    pub document_id: String,
    pub transaction_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_budget_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventKind {
    Chunk { text: String },
    Done,
    Error { error: String },
}

/// One message on the caller's chat channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatEvent {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(flatten)]
    pub kind: ChatEventKind,
}

impl ChatEvent {
    pub fn chunk(correlation_id: &str, text: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            kind: ChatEventKind::Chunk { text: text.into() },
        }
    }

    pub fn done(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            kind: ChatEventKind::Done,
        }
    }

    pub fn error(correlation_id: &str, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            kind: ChatEventKind::Error { error: error.into() },
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ChatEventKind::Chunk { .. })
    }
}
