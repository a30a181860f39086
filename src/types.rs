//! Core domain types shared by the stream, signal and workflow layers
//!
//! Everything here is plain data. Rows coming from the change feed or the
//! bridged endpoint are validated into these types at the boundary
//! (see `stream::envelope`) before anything else sees them.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Spending category (fixed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Rent,
    Groceries,
    Transport,
    Entertainment,
    Savings,
    EmergencyFund,
    Utilities,
    Healthcare,
    Education,
    Dining,
    Shopping,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Rent => "rent",
            Category::Groceries => "groceries",
            Category::Transport => "transport",
            Category::Entertainment => "entertainment",
            Category::Savings => "savings",
            Category::EmergencyFund => "emergency_fund",
            Category::Utilities => "utilities",
            Category::Healthcare => "healthcare",
            Category::Education => "education",
            Category::Dining => "dining",
            Category::Shopping => "shopping",
            Category::Other => "other",
        }
    }

    pub fn all() -> [Category; 12] {
        [
            Category::Rent,
            Category::Groceries,
            Category::Transport,
            Category::Entertainment,
            Category::Savings,
            Category::EmergencyFund,
            Category::Utilities,
            Category::Healthcare,
            Category::Education,
            Category::Dining,
            Category::Shopping,
            Category::Other,
        ]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::all()
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

/// A persisted spending transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub amount: f64,
    pub category: Category,
    #[serde(rename = "transaction_date")]
    pub date: NaiveDate,
    pub merchant: Option<String>,
    pub description: Option<String>,
    pub document_id: Option<String>,
}

/// A transaction that has not been persisted yet (no id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub amount: f64,
    pub category: Category,
    #[serde(alias = "transaction_date")]
    pub date: NaiveDate,
    pub merchant: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Monthly,
    Yearly,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Yearly => "yearly",
        }
    }

    /// Inclusive accounting window containing `when`
    pub fn bounds(&self, when: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            BudgetPeriod::Yearly => (
                NaiveDate::from_ymd_opt(when.year(), 1, 1).unwrap_or(when),
                NaiveDate::from_ymd_opt(when.year(), 12, 31).unwrap_or(when),
            ),
            BudgetPeriod::Monthly => {
                let start = when.with_day(1).unwrap_or(when);
                let next_month = if when.month() == 12 {
                    NaiveDate::from_ymd_opt(when.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(when.year(), when.month() + 1, 1)
                };
                let end = next_month.and_then(|d| d.pred_opt()).unwrap_or(when);
                (start, end)
            }
        }
    }
}

impl FromStr for BudgetPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "monthly" => Ok(BudgetPeriod::Monthly),
            "yearly" => Ok(BudgetPeriod::Yearly),
            other => Err(format!("unknown budget period: {}", other)),
        }
    }
}

/// Per-owner budget. At most one is active per owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub period: BudgetPeriod,
    pub allocations: BTreeMap<Category, f64>,
    pub is_active: bool,
}

impl Budget {
    /// Allocation for a category; untracked categories are 0
    pub fn allocation(&self, category: Category) -> f64 {
        self.allocations.get(&category).copied().unwrap_or(0.0)
    }
}

/// Budget that the store has not assigned an id to yet
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDraft {
    pub owner_id: String,
    pub period: BudgetPeriod,
    pub allocations: BTreeMap<Category, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Outcome of running the anomaly detector on one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub severity: Severity,
    pub reason: String,
    pub z_score: f64,
    pub mean: f64,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub owner_id: String,
    pub category: Category,
    pub budgeted: f64,
    pub spent: f64,
    pub percent_used: f64,
    pub status: AlertStatus,
}

impl BudgetAlert {
    pub fn message(&self) -> String {
        match self.status {
            AlertStatus::Exceeded => format!(
                "You've exceeded your {} budget (₹{:.2} / ₹{:.2}).",
                self.category, self.spent, self.budgeted
            ),
            AlertStatus::Warning => format!(
                "You've used {:.0}% of your {} budget (₹{:.2} / ₹{:.2}).",
                self.percent_used, self.category, self.spent, self.budgeted
            ),
        }
    }
}

/// A document whose OCR processing just completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BudgetWarning,
    BudgetExceeded,
    TransactionAlert,
    DocumentReady,
    SystemAlert,
}

impl NotificationKind {
    pub fn default_title(&self) -> &'static str {
        match self {
            NotificationKind::BudgetWarning => "⚠️ Budget Warning",
            NotificationKind::BudgetExceeded => "🔴 Budget Exceeded",
            NotificationKind::TransactionAlert => "🔔 Transaction Alert",
            NotificationKind::DocumentReady => "✅ Document Ready",
            NotificationKind::SystemAlert => "ℹ️ System Alert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "user_id")]
    pub owner_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub category: Option<Category>,
}

impl Notification {
    pub fn new(owner_id: impl Into<String>, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind,
            title: kind.default_title().to_string(),
            message: message.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

impl From<&BudgetAlert> for Notification {
    fn from(alert: &BudgetAlert) -> Self {
        let kind = match alert.status {
            AlertStatus::Warning => NotificationKind::BudgetWarning,
            AlertStatus::Exceeded => NotificationKind::BudgetExceeded,
        };
        Notification::new(alert.owner_id.clone(), kind, alert.message()).with_category(alert.category)
    }
}

impl From<&AnomalyResult> for Notification {
    fn from(result: &AnomalyResult) -> Self {
        Notification::new(
            result.transaction.owner_id.clone(),
            NotificationKind::TransactionAlert,
            result.reason.clone(),
        )
        .with_category(result.transaction.category)
    }
}

/// Derived analytics update (category/total spending for one month)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub event_type: String,
    pub period: String,
    pub category: Option<Category>,
    pub amount: f64,
}

/// Canonical event delivered by the event source, one variant per entity type
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Transaction(Transaction),
    Budget(Budget),
    DocumentProcessed(DocumentEvent),
    Notification(Notification),
    Analytics(AnalyticsEvent),
}

impl PipelineEvent {
    pub fn owner_id(&self) -> &str {
        match self {
            PipelineEvent::Transaction(t) => &t.owner_id,
            PipelineEvent::Budget(b) => &b.owner_id,
            PipelineEvent::DocumentProcessed(d) => &d.owner_id,
            PipelineEvent::Notification(n) => &n.owner_id,
            PipelineEvent::Analytics(a) => &a.owner_id,
        }
    }
}

/// `YYYY-MM` key used by the analytics tables
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_monthly_bounds() {
        assert_eq!(BudgetPeriod::Monthly.bounds(d(2024, 2, 14)), (d(2024, 2, 1), d(2024, 2, 29)));
        assert_eq!(BudgetPeriod::Monthly.bounds(d(2023, 12, 31)), (d(2023, 12, 1), d(2023, 12, 31)));
    }

    #[test]
    fn test_yearly_bounds() {
        assert_eq!(BudgetPeriod::Yearly.bounds(d(2024, 7, 4)), (d(2024, 1, 1), d(2024, 12, 31)));
    }

    #[test]
    fn test_category_round_trip_names() {
        assert_eq!("emergency_fund".parse::<Category>().unwrap(), Category::EmergencyFund);
        assert!("gadgets".parse::<Category>().is_err());
        let json = serde_json::to_string(&Category::EmergencyFund).unwrap();
        assert_eq!(json, "\"emergency_fund\"");
    }

    #[test]
    fn test_alert_messages() {
        let alert = BudgetAlert {
            owner_id: "u1".to_string(),
            category: Category::Groceries,
            budgeted: 1000.0,
            spent: 850.0,
            percent_used: 85.0,
            status: AlertStatus::Warning,
        };
        assert_eq!(alert.message(), "You've used 85% of your groceries budget (₹850.00 / ₹1000.00).");

        let notification = Notification::from(&alert);
        assert_eq!(notification.kind, NotificationKind::BudgetWarning);
        assert_eq!(notification.title, "⚠️ Budget Warning");
        assert_eq!(notification.category, Some(Category::Groceries));
    }

    #[test]
    fn test_month_key() {
        assert_eq!(month_key(d(2024, 3, 9)), "2024-03");
    }
}
