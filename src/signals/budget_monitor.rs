//! Budget threshold evaluation
//!
//! Period bounds come from the transaction's own date, so a late-arriving
//! transaction is judged against the period it belongs to.

use crate::store::{LedgerStore, StoreError};
use crate::types::{AlertStatus, BudgetAlert, Transaction};
use std::sync::Arc;

pub const WARNING_PERCENT: f64 = 80.0;
pub const EXCEEDED_PERCENT: f64 = 100.0;

pub struct BudgetMonitor {
    store: Arc<dyn LedgerStore>,
}

impl BudgetMonitor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// At most one alert for the transaction's category
    ///
    /// Spend is the stored same-category total for the period, excluding this
    /// transaction's id, plus this transaction's amount.
    pub async fn evaluate(&self, transaction: &Transaction) -> Result<Option<BudgetAlert>, StoreError> {
        let budget = match self.store.active_budget(&transaction.owner_id).await? {
            Some(budget) => budget,
            None => return Ok(None),
        };

        let budgeted = budget.allocation(transaction.category);
        if budgeted <= 0.0 {
            return Ok(None);
        }

        let (start, end) = budget.period.bounds(transaction.date);
        let prior = self
            .store
            .category_spend(
                &transaction.owner_id,
                transaction.category,
                start,
                end,
                Some(&transaction.id),
            )
            .await?;

        Ok(classify(transaction, budgeted, prior + transaction.amount))
    }
}

pub fn classify(transaction: &Transaction, budgeted: f64, spent: f64) -> Option<BudgetAlert> {
    if budgeted <= 0.0 {
        return None;
    }

    let percent_used = spent * 100.0 / budgeted;
    let status = if percent_used >= EXCEEDED_PERCENT {
        AlertStatus::Exceeded
    } else if percent_used >= WARNING_PERCENT {
        AlertStatus::Warning
    } else {
        return None;
    };

    Some(BudgetAlert {
        owner_id: transaction.owner_id.clone(),
        category: transaction.category,
        budgeted,
        spent,
        percent_used,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteLedgerStore;
    use crate::types::{BudgetDraft, BudgetPeriod, Category, TransactionDraft};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn transaction(id: &str, amount: f64, date: NaiveDate) -> Transaction {
        Transaction {
            id: id.to_string(),
            owner_id: "u1".to_string(),
            amount,
            category: Category::Groceries,
            date,
            merchant: None,
            description: None,
            document_id: None,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_thresholds() {
        let t = transaction("t", 0.0, d(2024, 1, 1));
        assert!(classify(&t, 1000.0, 799.99).is_none());
        assert_eq!(classify(&t, 1000.0, 800.0).unwrap().status, AlertStatus::Warning);
        assert_eq!(classify(&t, 1000.0, 999.0).unwrap().status, AlertStatus::Warning);
        assert_eq!(classify(&t, 1000.0, 1000.0).unwrap().status, AlertStatus::Exceeded);
        assert!(classify(&t, 0.0, 5000.0).is_none());
    }

    async fn store_with_budget(groceries: f64) -> Arc<SqliteLedgerStore> {
        let store = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
        let mut allocations = BTreeMap::new();
        allocations.insert(Category::Groceries, groceries);
        store
            .activate_budget(BudgetDraft {
                owner_id: "u1".to_string(),
                period: BudgetPeriod::Monthly,
                allocations,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_no_budget_no_alert() {
        let store = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
        let monitor = BudgetMonitor::new(store);
        let alert = monitor.evaluate(&transaction("t", 5000.0, d(2024, 3, 3))).await.unwrap();
        assert!(alert.is_none());
    }

    #[tokio::test]
    async fn test_untracked_category_no_alert() {
        let store = store_with_budget(1000.0).await;
        let monitor = BudgetMonitor::new(store);
        let mut t = transaction("t", 5000.0, d(2024, 3, 3));
        t.category = Category::Shopping;
        assert!(monitor.evaluate(&t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_period_comes_from_transaction_date() {
        let store = store_with_budget(1000.0).await;
        store
            .insert_transactions(
                "u1",
                &[TransactionDraft {
                    amount: 900.0,
                    category: Category::Groceries,
                    date: d(2024, 2, 10),
                    merchant: None,
                    description: None,
                }],
                None,
            )
            .await
            .unwrap();
        let monitor = BudgetMonitor::new(store);

        // Late-arriving February transaction sees February spend
        let late = monitor.evaluate(&transaction("late", 50.0, d(2024, 2, 28))).await.unwrap().unwrap();
        assert_eq!(late.spent, 950.0);
        assert_eq!(late.status, AlertStatus::Warning);

        // March starts fresh
        assert!(monitor.evaluate(&transaction("march", 50.0, d(2024, 3, 1))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persisted_transaction_not_double_counted() {
        let store = store_with_budget(1000.0).await;
        let inserted = store
            .insert_transactions(
                "u1",
                &[TransactionDraft {
                    amount: 850.0,
                    category: Category::Groceries,
                    date: d(2024, 4, 2),
                    merchant: None,
                    description: None,
                }],
                None,
            )
            .await
            .unwrap();
        let monitor = BudgetMonitor::new(store);

        let alert = monitor.evaluate(&inserted[0]).await.unwrap().unwrap();
        assert_eq!(alert.spent, 850.0);
        assert_eq!(alert.percent_used, 85.0);
    }
}
