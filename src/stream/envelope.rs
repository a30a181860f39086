//! Boundary validation for rows and bridged envelopes
//!
//! Both transports hand over loosely-typed JSON. Nothing leaves this module
//! unless it has been mapped into a domain type; anything that does not fit
//! is rejected with an [`EnvelopeError`] and dropped by the caller.
//!
//! Bridged wire format, one message per line (optionally SSE `data:` prefixed):
//!
//! ```text
//! data: {"type":"transaction","payload":{"id":"t1","user_id":"u1","amount":"12.50",...}}
//! ```

use crate::types::{
    AnalyticsEvent, Budget, BudgetPeriod, Category, DocumentEvent, Notification, PipelineEvent,
    Transaction,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeError(pub String);

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rejected envelope: {}", self.0)
    }
}

impl std::error::Error for EnvelopeError {}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError(err.to_string())
    }
}

/// Amount as either a JSON number or a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(f64),
    Text(String),
}

impl RawAmount {
    fn coerce(&self) -> Result<f64, EnvelopeError> {
        let value = match self {
            RawAmount::Number(n) => *n,
            RawAmount::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| EnvelopeError(format!("amount is not numeric: {:?}", s)))?,
        };
        if !value.is_finite() || value < 0.0 {
            return Err(EnvelopeError(format!("amount out of range: {}", value)));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: RawAmount,
    pub category: String,
    pub transaction_date: String,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
}

impl RawTransaction {
    pub fn validate(self) -> Result<Transaction, EnvelopeError> {
        if self.id.trim().is_empty() || self.user_id.trim().is_empty() {
            return Err(EnvelopeError("id and user_id must be non-empty".to_string()));
        }
        let category: Category = self.category.parse().map_err(EnvelopeError)?;
        Ok(Transaction {
            amount: self.amount.coerce()?,
            date: parse_date(&self.transaction_date)?,
            id: self.id,
            owner_id: self.user_id,
            category,
            merchant: self.merchant,
            description: self.description,
            document_id: self.document_id,
        })
    }
}

/// Budget row. Allocations arrive either as an `allocations` object or as
/// one column per category name.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBudget {
    pub id: String,
    pub user_id: String,
    pub period: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub allocations: Option<HashMap<String, Option<RawAmount>>>,
    #[serde(flatten)]
    pub columns: HashMap<String, serde_json::Value>,
}

impl RawBudget {
    pub fn validate(self) -> Result<Budget, EnvelopeError> {
        let period: BudgetPeriod = self.period.parse().map_err(EnvelopeError)?;
        let mut allocations = BTreeMap::new();

        match self.allocations {
            Some(map) => {
                for (name, amount) in map {
                    let category: Category = name.parse().map_err(EnvelopeError)?;
                    if let Some(amount) = amount {
                        allocations.insert(category, amount.coerce()?);
                    }
                }
            }
            None => {
                for category in Category::all() {
                    let value = match self.columns.get(category.as_str()) {
                        None | Some(serde_json::Value::Null) => continue,
                        Some(v) => v.clone(),
                    };
                    let amount: RawAmount = serde_json::from_value(value)?;
                    allocations.insert(category, amount.coerce()?);
                }
            }
        }

        Ok(Budget {
            id: self.id,
            owner_id: self.user_id,
            period,
            allocations,
            is_active: self.is_active,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl RawDocument {
    pub fn into_event(self) -> DocumentEvent {
        DocumentEvent {
            id: self.id,
            owner_id: self.user_id,
            file_name: self.file_name,
        }
    }
}

/// Tagged message on the bridged endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeEnvelope {
    Transaction(RawTransaction),
    Budget(RawBudget),
    Document(RawDocument),
    Notification(Notification),
    Analytics(AnalyticsEvent),
}

impl BridgeEnvelope {
    /// Validate into a canonical event. Documents that are not yet processed are
    /// not events and yield `Ok(None)`.
    pub fn into_event(self) -> Result<Option<PipelineEvent>, EnvelopeError> {
        let event = match self {
            BridgeEnvelope::Transaction(raw) => PipelineEvent::Transaction(raw.validate()?),
            BridgeEnvelope::Budget(raw) => PipelineEvent::Budget(raw.validate()?),
            BridgeEnvelope::Document(raw) if raw.processed => PipelineEvent::DocumentProcessed(raw.into_event()),
            BridgeEnvelope::Document(_) => return Ok(None),
            BridgeEnvelope::Notification(n) => PipelineEvent::Notification(n),
            BridgeEnvelope::Analytics(a) => PipelineEvent::Analytics(a),
        };
        Ok(Some(event))
    }
}

/// Decode one line from the bridged stream
///
/// Blank lines, SSE comments and non-`data` SSE fields yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<BridgeEnvelope>, EnvelopeError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let body = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if line.starts_with('{') => line,
        None => return Ok(None),
    };
    if body == "[DONE]" {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(body)?))
}

/// Accepts `YYYY-MM-DD` or a timestamp starting with it
pub fn parse_date(value: &str) -> Result<NaiveDate, EnvelopeError> {
    let value = value.trim();
    let day = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| EnvelopeError(format!("invalid transaction_date: {:?}", value)))
}
