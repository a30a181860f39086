//! Structured output extraction from completion text
//!
//! Completion output is free text that should contain one JSON object or
//! array. The outermost `{...}` / `[...]` span is taken and parsed.

use crate::resilience::CallError;
use crate::stream::envelope::{parse_date, RawAmount};
use crate::types::{Category, TransactionDraft};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Receipt,
    BankStatement,
    Other,
}

impl DocumentKind {
    pub fn is_supported(&self) -> bool {
        !matches!(self, DocumentKind::Other)
    }
}

fn outer_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

pub fn extract_json_object(text: &str) -> Option<Value> {
    serde_json::from_str(outer_span(text, '{', '}')?).ok()
}

pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    serde_json::from_str(outer_span(text, '[', ']')?).ok()
}

/// `{"type": "receipt"}` style classification; anything unrecognized is `Other`
pub fn parse_document_kind(text: &str) -> DocumentKind {
    let kind = extract_json_object(text)
        .and_then(|obj| obj.get("type").and_then(Value::as_str).map(|s| s.trim().to_lowercase()));
    match kind.as_deref() {
        Some("receipt") => DocumentKind::Receipt,
        Some("bank_statement") => DocumentKind::BankStatement,
        _ => DocumentKind::Other,
    }
}

/// Budget allocation object keyed by category name
///
/// Every key must be a known category and every value a non-negative number
/// (or numeric string). Categories left out are allocated zero.
pub fn parse_budget_suggestion(text: &str) -> Result<BTreeMap<Category, f64>, CallError> {
    let failed = |detail: String| CallError::Permanent(format!("Failed to parse budget suggestion: {}", detail));

    let object = extract_json_object(text).ok_or_else(|| failed("no JSON object in response".to_string()))?;
    let map = object
        .as_object()
        .ok_or_else(|| failed("response is not an object".to_string()))?;

    let mut allocations = BTreeMap::new();
    for (name, value) in map {
        let category: Category = name.parse().map_err(failed)?;
        let amount = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| failed(format!("invalid amount for {}", name)))?;
        allocations.insert(category, amount);
    }

    if allocations.is_empty() {
        return Err(failed("no categories allocated".to_string()));
    }
    for category in Category::all() {
        allocations.entry(category).or_insert(0.0);
    }
    Ok(allocations)
}

#[derive(Debug, Deserialize)]
struct ParsedTransaction {
    #[serde(default)]
    amount: Option<RawAmount>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Transactions from a receipt/statement parse
///
/// Entries without a usable amount are skipped. Missing or invalid dates fall
/// back to `fallback_date`; unknown categories become `other`.
pub fn parse_transaction_drafts(text: &str, fallback_date: NaiveDate) -> Vec<TransactionDraft> {
    let entries = match extract_json_array(text) {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<ParsedTransaction>(entry).ok())
        .filter_map(|parsed| {
            let amount = match parsed.amount? {
                RawAmount::Number(n) => n,
                RawAmount::Text(s) => s.trim().trim_start_matches('₹').trim().parse().ok()?,
            };
            if !amount.is_finite() || amount < 0.0 {
                return None;
            }
            let date = parsed
                .date
                .as_deref()
                .and_then(|d| parse_date(d).ok())
                .unwrap_or(fallback_date);
            let category = parsed
                .category
                .as_deref()
                .and_then(|c| c.trim().to_lowercase().parse().ok())
                .unwrap_or(Category::Other);

            Some(TransactionDraft {
                amount,
                category,
                date,
                merchant: Some(
                    parsed
                        .merchant
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
                description: parsed.description,
            })
        })
        .collect()
}
