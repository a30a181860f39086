//! SQLite-backed ledger
//!
//! The schema is embedded and idempotent (`IF NOT EXISTS`), applied on open.
//! The connection sits behind a mutex; every method takes the lock for the
//! duration of one statement or one SQL transaction.

use super::{ChatMessage, ChatRole, LedgerStore, SpendingSummary, StoreError};
use crate::types::{Budget, BudgetDraft, BudgetPeriod, Category, Transaction, TransactionDraft};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    amount              REAL NOT NULL,
    category            TEXT NOT NULL,
    transaction_date    TEXT NOT NULL,
    merchant            TEXT,
    description         TEXT,
    document_id         TEXT,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_owner_category
    ON transactions (user_id, category, transaction_date);

CREATE TABLE IF NOT EXISTS budgets (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    period              TEXT NOT NULL,
    allocations_json    TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 0,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS income_records (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id             TEXT NOT NULL,
    amount              REAL NOT NULL,
    source              TEXT,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id                  TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    ocr_text            TEXT,
    processed           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS chat_history (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id             TEXT NOT NULL,
    role                TEXT NOT NULL,
    message             TEXT NOT NULL,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS category_spending (
    user_id             TEXT NOT NULL,
    category            TEXT NOT NULL,
    period              TEXT NOT NULL,
    total_spent         REAL NOT NULL,
    PRIMARY KEY (user_id, category, period)
);

CREATE TABLE IF NOT EXISTS total_spending (
    user_id             TEXT NOT NULL,
    period              TEXT NOT NULL,
    total_spent         REAL NOT NULL,
    PRIMARY KEY (user_id, period)
);
"#;

pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open (or create) the ledger at `db_path` and apply the schema
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("📊 Opened ledger at {} (WAL)", db_path);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type TransactionRow = (
    String,
    String,
    f64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn transaction_from_row(row: TransactionRow) -> Result<Transaction, StoreError> {
    let (id, owner_id, amount, category, date, merchant, description, document_id) = row;
    let category: Category = category.parse().map_err(StoreError::Corrupt)?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("transaction {} date: {}", id, e)))?;
    Ok(Transaction {
        id,
        owner_id,
        amount,
        category,
        date,
        merchant,
        description,
        document_id,
    })
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn recent_transactions(
        &self,
        owner_id: &str,
        category: Category,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, amount, category, transaction_date, merchant, description, document_id
            FROM transactions
            WHERE user_id = ?1 AND category = ?2 AND (?3 IS NULL OR id != ?3)
            ORDER BY transaction_date DESC, created_at DESC
            LIMIT ?4
            "#,
        )?;

        let rows = stmt
            .query_map(params![owner_id, category.as_str(), exclude_id, limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<Result<Vec<TransactionRow>, _>>()?;

        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn latest_transactions(&self, owner_id: &str, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, amount, category, transaction_date, merchant, description, document_id
            FROM transactions
            WHERE user_id = ?1
            ORDER BY transaction_date DESC, created_at DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![owner_id, limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<Result<Vec<TransactionRow>, _>>()?;

        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn category_spend(
        &self,
        owner_id: &str,
        category: Category,
        start: NaiveDate,
        end: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<f64, StoreError> {
        let conn = self.lock();
        let spent: f64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(amount), 0.0)
            FROM transactions
            WHERE user_id = ?1 AND category = ?2
              AND transaction_date >= ?3 AND transaction_date <= ?4
              AND (?5 IS NULL OR id != ?5)
            "#,
            params![
                owner_id,
                category.as_str(),
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string(),
                exclude_id,
            ],
            |row| row.get(0),
        )?;
        Ok(spent)
    }

    async fn active_budget(&self, owner_id: &str) -> Result<Option<Budget>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                r#"
                SELECT id, period, allocations_json FROM budgets
                WHERE user_id = ?1 AND is_active = 1
                ORDER BY created_at DESC
                LIMIT 1
                "#,
                params![owner_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, period, allocations_json)) => {
                let period: BudgetPeriod = period.parse().map_err(StoreError::Corrupt)?;
                let allocations: BTreeMap<Category, f64> = serde_json::from_str(&allocations_json)?;
                Ok(Some(Budget {
                    id,
                    owner_id: owner_id.to_string(),
                    period,
                    allocations,
                    is_active: true,
                }))
            }
        }
    }

    async fn activate_budget(&self, draft: BudgetDraft) -> Result<Budget, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let allocations_json = serde_json::to_string(&draft.allocations)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE budgets SET is_active = 0 WHERE user_id = ?1 AND is_active = 1",
            params![draft.owner_id],
        )?;
        tx.execute(
            r#"
            INSERT INTO budgets (id, user_id, period, allocations_json, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            "#,
            params![id, draft.owner_id, draft.period.as_str(), allocations_json, now_ts()],
        )?;
        tx.commit()?;

        Ok(Budget {
            id,
            owner_id: draft.owner_id,
            period: draft.period,
            allocations: draft.allocations,
            is_active: true,
        })
    }

    async fn insert_transactions(
        &self,
        owner_id: &str,
        drafts: &[TransactionDraft],
        document_id: Option<&str>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(drafts.len());

        for draft in drafts {
            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                r#"
                INSERT INTO transactions (
                    id, user_id, amount, category, transaction_date,
                    merchant, description, document_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    id,
                    owner_id,
                    draft.amount,
                    draft.category.as_str(),
                    draft.date.format("%Y-%m-%d").to_string(),
                    draft.merchant,
                    draft.description,
                    document_id,
                    now_ts(),
                ],
            )?;
            inserted.push(Transaction {
                id,
                owner_id: owner_id.to_string(),
                amount: draft.amount,
                category: draft.category,
                date: draft.date,
                merchant: draft.merchant.clone(),
                description: draft.description.clone(),
                document_id: document_id.map(str::to_string),
            });
        }

        tx.commit()?;
        Ok(inserted)
    }

    async fn total_income(&self, owner_id: &str) -> Result<f64, StoreError> {
        let conn = self.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0.0) FROM income_records WHERE user_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    async fn add_income(&self, owner_id: &str, amount: f64, source: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO income_records (user_id, amount, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![owner_id, amount, source, now_ts()],
        )?;
        Ok(())
    }

    async fn mark_document_processed(
        &self,
        owner_id: &str,
        document_id: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO documents (id, user_id, ocr_text, processed) VALUES (?1, ?2, ?3, 1)
            ON CONFLICT(id) DO UPDATE SET ocr_text = excluded.ocr_text, processed = 1
            "#,
            params![document_id, owner_id, text],
        )?;
        Ok(())
    }

    async fn recent_chat(&self, owner_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT role, message FROM chat_history
            WHERE user_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![owner_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = rows
            .into_iter()
            .map(|(role, text)| {
                let role = match role.as_str() {
                    "user" => ChatRole::User,
                    "model" => ChatRole::Model,
                    other => return Err(StoreError::Corrupt(format!("unknown chat role: {}", other))),
                };
                Ok(ChatMessage { role, text })
            })
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn append_chat(&self, owner_id: &str, role: ChatRole, text: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO chat_history (user_id, role, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![owner_id, role.as_str(), text, now_ts()],
        )?;
        Ok(())
    }

    async fn record_spending(
        &self,
        owner_id: &str,
        category: Category,
        period: &str,
        amount: f64,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO category_spending (user_id, category, period, total_spent)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, category, period) DO UPDATE SET
                total_spent = total_spent + excluded.total_spent
            "#,
            params![owner_id, category.as_str(), period, amount],
        )?;
        tx.execute(
            r#"
            INSERT INTO total_spending (user_id, period, total_spent)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, period) DO UPDATE SET
                total_spent = total_spent + excluded.total_spent
            "#,
            params![owner_id, period, amount],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn spending_summary(&self, owner_id: &str, period: &str) -> Result<SpendingSummary, StoreError> {
        let conn = self.lock();
        let total_spent: f64 = conn
            .query_row(
                "SELECT total_spent FROM total_spending WHERE user_id = ?1 AND period = ?2",
                params![owner_id, period],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0.0);

        let mut stmt = conn.prepare(
            "SELECT category, total_spent FROM category_spending WHERE user_id = ?1 AND period = ?2",
        )?;
        let rows = stmt
            .query_map(params![owner_id, period], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut by_category = BTreeMap::new();
        for (category, spent) in rows {
            let category: Category = category.parse().map_err(StoreError::Corrupt)?;
            by_category.insert(category, spent);
        }

        Ok(SpendingSummary {
            period: period.to_string(),
            total_spent,
            by_category,
        })
    }
}
