//! Store configuration types.

use crate::error::{ThoughtError, ThoughtResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable carrying the database connection string.
pub const DATABASE_URL_ENV: &str = "THOUGHTSTORE_DATABASE_URL";

/// Configuration for a relational memory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection string: `:memory:`, `sqlite://path`, a `file:` URI, or a bare path.
    pub database_url: String,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Extra attempts for read operations that hit a busy database.
    pub read_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            busy_timeout_ms: 5_000,
            read_retries: 2,
        }
    }
}

impl StoreConfig {
    /// Configuration for an explicit connection string, other fields default.
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Build from `THOUGHTSTORE_DATABASE_URL`. Fails when the variable is unset or blank.
    pub fn from_env() -> ThoughtResult<Self> {
        database_url_from_env()
            .map(Self::with_url)
            .ok_or_else(|| ThoughtError::Config(format!("{DATABASE_URL_ENV} is not set")))
    }
}

/// The connection string from the environment, if set and non-blank.
pub fn database_url_from_env() -> Option<String> {
    std::env::var(DATABASE_URL_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Home directory for thoughtstore files (`~/.thoughtstore`).
pub fn thoughtstore_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".thoughtstore")
}

fn default_database_url() -> String {
    thoughtstore_home()
        .join("thoughts.db")
        .to_string_lossy()
        .into_owned()
}
