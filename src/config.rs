// Runtime configuration - environment variables, .env and logging setup
// A .env file in the working directory is loaded first when present

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, TrackerError};

pub const DEFAULT_DB_PATH: &str = "expenses.db";
pub const DEFAULT_MODEL_PATH: &str = "smartcat_model.json";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// Process configuration shared by the CLI and the server
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Serialized vectorizer + classifier artifact
    pub model_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// A missing .env is fine; an unreadable or malformed one is not
fn load_dotenv(loaded: std::result::Result<PathBuf, dotenvy::Error>) -> Result<()> {
    match loaded {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "loaded .env");
            Ok(())
        }
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(TrackerError::Config(format!("failed to load .env: {}", e))),
    }
}

impl Config {
    /// Load `.env` (if any) and read configuration from the environment
    pub fn from_env() -> Result<Self> {
        load_dotenv(dotenvy::dotenv())?;
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let bind = get("EXPENSE_BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind.parse::<SocketAddr>().map_err(|e| {
            TrackerError::Config(format!("invalid EXPENSE_BIND_ADDR '{}': {}", bind, e))
        })?;

        let format = match get("LOG_FORMAT", "pretty").to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(TrackerError::Config(format!(
                    "invalid LOG_FORMAT '{}': expected 'pretty' or 'json'",
                    other
                )))
            }
        };

        Ok(Config {
            db_path: PathBuf::from(get("EXPENSE_DB_PATH", DEFAULT_DB_PATH)),
            model_path: PathBuf::from(get("EXPENSE_MODEL_PATH", DEFAULT_MODEL_PATH)),
            bind_addr,
            logging: LoggingConfig {
                level: get("LOG_LEVEL", "info"),
                format,
            },
        })
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format {
            LogFormat::Json => fmt().json().with_env_filter(filter).init(),
            LogFormat::Pretty => fmt().with_env_filter(filter).init(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}
