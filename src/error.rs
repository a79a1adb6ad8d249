// Error types for the expense tracker library
// Binaries wrap these in anyhow; the HTTP layer maps them to status codes

use thiserror::Error;

/// The main error type for expense tracker operations
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Unknown expense id on get/update/delete
    #[error("Expense not found: {0}")]
    NotFound(i64),

    /// Malformed create/update payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Categorization requested but no model artifact was loaded
    #[error("Categorization model not loaded")]
    ModelUnavailable,

    /// Model artifact could not be read or is inconsistent
    #[error("Model artifact error: {0}")]
    Model(String),

    /// Uploaded CSV is not UTF-8, malformed, or has a bad field
    #[error("Invalid CSV: {0}")]
    InvalidCsv(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    /// Errors caused by the caller's input rather than the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TrackerError::NotFound(_) | TrackerError::Validation(_) | TrackerError::InvalidCsv(_)
        )
    }
}
