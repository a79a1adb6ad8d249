use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TrackerError};

/// Column bounds carried over from the relational schema
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_CATEGORY_LEN: usize = 50;

/// A persisted expense record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: i64,
    pub title: String,
    pub amount: f64,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for create and update.
///
/// `amount` accepts either a JSON number or a numeric string. `created_at`
/// is honoured on create only; update never touches the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpensePayload {
    pub title: String,
    #[serde(deserialize_with = "deserialize_amount")]
    pub amount: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountInput {
    Number(f64),
    Text(String),
}

fn deserialize_amount<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match AmountInput::deserialize(deserializer)? {
        AmountInput::Number(n) => Ok(n),
        AmountInput::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("amount '{}' is not a number", s))),
    }
}

impl ExpensePayload {
    pub fn new(title: &str, amount: f64, category: &str) -> Self {
        Self {
            title: title.to_string(),
            amount,
            category: category.to_string(),
            created_at: None,
        }
    }

    /// Builder-style timestamp override, used by imports and tests
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Check the bounds the storage schema imposes
    pub fn validate(&self) -> Result<()> {
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(TrackerError::Validation(format!(
                "title must be at most {} characters",
                MAX_TITLE_LEN
            )));
        }
        if self.category.chars().count() > MAX_CATEGORY_LEN {
            return Err(TrackerError::Validation(format!(
                "category must be at most {} characters",
                MAX_CATEGORY_LEN
            )));
        }
        if !self.amount.is_finite() {
            return Err(TrackerError::Validation(
                "amount must be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn expense_from_row(row: &Row<'_>) -> rusqlite::Result<Expense> {
    let created_at_str: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Expense {
        id: row.get(0)?,
        title: row.get(1)?,
        amount: row.get(2)?,
        category: row.get(3)?,
        created_at,
    })
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // In-memory databases stay in "memory" mode
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "journal mode set");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_title ON expenses(title)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_category ON expenses(category)",
        [],
    )?;

    debug!("expenses schema ready");
    Ok(())
}

/// Open (or create) the database file and make sure the schema exists
pub fn open_database(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    info!(path = %path.display(), "database opened");
    Ok(conn)
}

pub fn list_expenses(conn: &Connection) -> Result<Vec<Expense>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, amount, category, created_at
         FROM expenses
         ORDER BY id",
    )?;

    let expenses = stmt
        .query_map([], expense_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(expenses)
}

pub fn list_expenses_by_category(conn: &Connection, category: &str) -> Result<Vec<Expense>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, amount, category, created_at
         FROM expenses
         WHERE category = ?1
         ORDER BY id",
    )?;

    let expenses = stmt
        .query_map([category], expense_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(expenses)
}

pub fn get_expense(conn: &Connection, id: i64) -> Result<Expense> {
    conn.query_row(
        "SELECT id, title, amount, category, created_at FROM expenses WHERE id = ?1",
        [id],
        expense_from_row,
    )
    .optional()?
    .ok_or(TrackerError::NotFound(id))
}

fn insert_row(conn: &Connection, payload: &ExpensePayload) -> Result<i64> {
    let created_at = payload.created_at.unwrap_or_else(Utc::now);

    conn.execute(
        "INSERT INTO expenses (title, amount, category, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            payload.title,
            payload.amount,
            payload.category,
            format_timestamp(&created_at),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn create_expense(conn: &Connection, payload: &ExpensePayload) -> Result<Expense> {
    payload.validate()?;
    let id = insert_row(conn, payload)?;
    debug!(id, category = %payload.category, "expense created");
    get_expense(conn, id)
}

/// Overwrite title, amount and category in place; the timestamp is kept
pub fn update_expense(conn: &Connection, id: i64, payload: &ExpensePayload) -> Result<Expense> {
    payload.validate()?;

    let changed = conn.execute(
        "UPDATE expenses SET title = ?1, amount = ?2, category = ?3 WHERE id = ?4",
        params![payload.title, payload.amount, payload.category, id],
    )?;

    if changed == 0 {
        return Err(TrackerError::NotFound(id));
    }

    debug!(id, "expense updated");
    get_expense(conn, id)
}

pub fn delete_expense(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute("DELETE FROM expenses WHERE id = ?1", [id])?;

    if changed == 0 {
        return Err(TrackerError::NotFound(id));
    }

    debug!(id, "expense deleted");
    Ok(())
}

/// Insert a batch inside one transaction. Either every row lands or none does.
pub fn insert_expenses(conn: &Connection, payloads: &[ExpensePayload]) -> Result<usize> {
    for payload in payloads {
        payload.validate()?;
    }

    let tx = conn.unchecked_transaction()?;
    for payload in payloads {
        insert_row(&tx, payload)?;
    }
    tx.commit()?;

    info!(inserted = payloads.len(), "batch insert committed");
    Ok(payloads.len())
}

pub fn count_expenses(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))?;

    Ok(count)
}
