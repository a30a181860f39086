//! Ledger persistence seam
//!
//! The core never talks to a database directly. Detectors, the budget
//! monitor and the workflows go through [`LedgerStore`]; the host decides
//! what backs it. [`SqliteLedgerStore`] is the bundled implementation.

pub mod sqlite;

use crate::resilience::CallError;
use crate::types::{Budget, BudgetDraft, Category, Transaction, TransactionDraft};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use sqlite::SqliteLedgerStore;

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Stored row could not be mapped back into a domain type
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Corrupt(msg) => write!(f, "Corrupt row: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) => CallError::Transient(err.to_string()),
            StoreError::Serialization(_) | StoreError::Corrupt(_) => CallError::Permanent(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

/// Derived analytics for one owner and one `YYYY-MM` period
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SpendingSummary {
    pub period: String,
    pub total_spent: f64,
    pub by_category: BTreeMap<Category, f64>,
}

/// Ledger operations used by the core
///
/// All date ranges are inclusive. `exclude_id` lets callers evaluate an
/// incoming transaction against its history whether or not it has already
/// been persisted.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Most recent transactions for owner + category, newest first
    async fn recent_transactions(
        &self,
        owner_id: &str,
        category: Category,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Most recent transactions for owner across all categories, newest first
    async fn latest_transactions(&self, owner_id: &str, limit: usize) -> Result<Vec<Transaction>, StoreError>;

    /// Sum of same-category amounts between `start` and `end`
    async fn category_spend(
        &self,
        owner_id: &str,
        category: Category,
        start: NaiveDate,
        end: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<f64, StoreError>;

    async fn active_budget(&self, owner_id: &str) -> Result<Option<Budget>, StoreError>;

    /// Insert a budget as the owner's only active one
    async fn activate_budget(&self, draft: BudgetDraft) -> Result<Budget, StoreError>;

    async fn insert_transactions(
        &self,
        owner_id: &str,
        drafts: &[TransactionDraft],
        document_id: Option<&str>,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn total_income(&self, owner_id: &str) -> Result<f64, StoreError>;

    async fn add_income(&self, owner_id: &str, amount: f64, source: &str) -> Result<(), StoreError>;

    async fn mark_document_processed(
        &self,
        owner_id: &str,
        document_id: &str,
        text: &str,
    ) -> Result<(), StoreError>;

    /// Most recent chat messages, oldest first
    async fn recent_chat(&self, owner_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append_chat(&self, owner_id: &str, role: ChatRole, text: &str) -> Result<(), StoreError>;

    /// Add `amount` to the category and total spending rows for `period`
    async fn record_spending(
        &self,
        owner_id: &str,
        category: Category,
        period: &str,
        amount: f64,
    ) -> Result<(), StoreError>;

    async fn spending_summary(&self, owner_id: &str, period: &str) -> Result<SpendingSummary, StoreError>;
}
