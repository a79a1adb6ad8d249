// CSV export and import for expenses
// Import resolves headers through an alias table and commits in one transaction

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{insert_expenses, list_expenses, Expense, ExpensePayload};
use crate::error::{Result, TrackerError};

/// Header written by every export
pub const EXPORT_HEADER: [&str; 5] = ["ID", "Title", "Amount", "Category", "Created_At"];

/// One exported line
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    #[serde(rename = "ID")]
    id: i64,

    #[serde(rename = "Title")]
    title: &'a str,

    #[serde(rename = "Amount")]
    amount: f64,

    #[serde(rename = "Category")]
    category: &'a str,

    #[serde(rename = "Created_At")]
    created_at: String,
}

// ============================================================================
// EXPORT
// ============================================================================

/// Serialize expenses to CSV bytes. The header is present even with no rows.
pub fn write_csv(expenses: &[Expense]) -> Result<Vec<u8>> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    wtr.write_record(EXPORT_HEADER)?;

    for e in expenses {
        wtr.serialize(CsvRow {
            id: e.id,
            title: &e.title,
            amount: e.amount,
            category: &e.category,
            created_at: e.created_at.to_rfc3339(),
        })?;
    }

    wtr.into_inner()
        .map_err(|e| TrackerError::Io(e.into_error()))
}

/// Export every stored expense in storage order
pub fn export_csv(conn: &Connection) -> Result<Vec<u8>> {
    let expenses = list_expenses(conn)?;
    let bytes = write_csv(&expenses)?;
    info!(rows = expenses.len(), "csv export built");
    Ok(bytes)
}

// ============================================================================
// IMPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Title,
    Amount,
    Category,
    CreatedAt,
}

/// Recognised header names, compared case-insensitively
const COLUMN_ALIASES: &[(&str, Column)] = &[
    ("title", Column::Title),
    ("amount", Column::Amount),
    ("category", Column::Category),
    ("created_at", Column::CreatedAt),
    ("date", Column::CreatedAt),
];

fn lookup_column(header: &str) -> Option<Column> {
    let normalized = header.trim().trim_start_matches('\u{feff}').to_lowercase();
    COLUMN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, column)| *column)
}

/// Header positions for the recognised columns
#[derive(Debug, Default)]
struct ColumnIndex {
    title: Option<usize>,
    amount: Option<usize>,
    category: Option<usize>,
    created_at: Option<usize>,
}

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Result<Self> {
        let mut index = ColumnIndex::default();

        for (pos, header) in headers.iter().enumerate() {
            let slot = match lookup_column(header) {
                Some(Column::Title) => &mut index.title,
                Some(Column::Amount) => &mut index.amount,
                Some(Column::Category) => &mut index.category,
                Some(Column::CreatedAt) => &mut index.created_at,
                None => continue,
            };
            // First matching header wins
            if slot.is_none() {
                *slot = Some(pos);
            }
        }

        let mut missing = Vec::new();
        if index.title.is_none() {
            missing.push("Title");
        }
        if index.amount.is_none() {
            missing.push("Amount");
        }
        if index.category.is_none() {
            missing.push("Category");
        }
        if !missing.is_empty() {
            return Err(TrackerError::InvalidCsv(format!(
                "missing required column(s): {}",
                missing.join(", ")
            )));
        }

        Ok(index)
    }
}

fn field<'r>(record: &'r StringRecord, pos: Option<usize>) -> &'r str {
    pos.and_then(|p| record.get(p)).unwrap_or("")
}

/// Parse the timestamp formats seen in exported files
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Rows accepted by the parser, plus how many were skipped
#[derive(Debug, Default)]
pub struct ParsedImport {
    pub rows: Vec<ExpensePayload>,
    pub skipped: usize,
}

/// Outcome of a committed import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Parse uploaded CSV bytes without touching storage.
///
/// A row is kept only when title, amount and category are all present and
/// the amount is non-zero. A non-numeric amount or unparseable timestamp
/// fails the whole parse.
pub fn parse_csv(bytes: &[u8]) -> Result<ParsedImport> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TrackerError::InvalidCsv(format!("file is not valid UTF-8: {}", e)))?;

    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = rdr
        .headers()
        .map_err(|e| TrackerError::InvalidCsv(e.to_string()))?
        .clone();
    let index = ColumnIndex::from_headers(&headers)?;

    let mut parsed = ParsedImport::default();

    for result in rdr.records() {
        let record = result.map_err(|e| TrackerError::InvalidCsv(e.to_string()))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let title = field(&record, index.title);
        let category = field(&record, index.category);
        let amount_raw = field(&record, index.amount).trim();

        let amount = if amount_raw.is_empty() {
            None
        } else {
            Some(amount_raw.parse::<f64>().map_err(|_| {
                TrackerError::InvalidCsv(format!(
                    "line {}: amount '{}' is not a number",
                    line, amount_raw
                ))
            })?)
        };

        // Zero amounts are treated like missing values and dropped
        let amount = match amount {
            Some(a) if a != 0.0 && !title.is_empty() && !category.is_empty() => a,
            _ => {
                parsed.skipped += 1;
                continue;
            }
        };

        let mut payload = ExpensePayload::new(title, amount, category);

        let created_raw = field(&record, index.created_at);
        if !created_raw.trim().is_empty() {
            let ts = parse_timestamp(created_raw).ok_or_else(|| {
                TrackerError::InvalidCsv(format!(
                    "line {}: unrecognised timestamp '{}'",
                    line, created_raw
                ))
            })?;
            payload = payload.at(ts);
        }

        payload
            .validate()
            .map_err(|e| TrackerError::InvalidCsv(format!("line {}: {}", line, e)))?;

        parsed.rows.push(payload);
    }

    Ok(parsed)
}

/// Parse and store an uploaded CSV atomically
pub fn import_csv(conn: &Connection, bytes: &[u8]) -> Result<ImportSummary> {
    let parsed = parse_csv(bytes)?;

    if parsed.skipped > 0 {
        warn!(skipped = parsed.skipped, "csv rows skipped (missing field or zero amount)");
    }

    let imported = insert_expenses(conn, &parsed.rows)?;
    info!(imported, "csv import committed");

    Ok(ImportSummary {
        imported,
        skipped: parsed.skipped,
    })
}
