// Expense Tracker - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod analytics;
pub mod categorizer;
pub mod config;
pub mod csv_io;
pub mod db;
pub mod error;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use analytics::{
    detect_anomalies, forecast_next_month, personalized_summary,
    Anomaly, Forecast, Summary,
};
pub use categorizer::{
    categorize, Categorizer, Classifier, DecisionTree, ForestClassifier, LinearClassifier,
    TfidfVectorizer, TreeNode,
};
pub use config::{Config, LogFormat, LoggingConfig};
pub use csv_io::{export_csv, import_csv, parse_csv, ImportSummary};
pub use db::{
    Expense, ExpensePayload,
    setup_database, open_database,
    list_expenses, list_expenses_by_category, get_expense,
    create_expense, update_expense, delete_expense,
    insert_expenses, count_expenses,
};
pub use error::{Result, TrackerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
