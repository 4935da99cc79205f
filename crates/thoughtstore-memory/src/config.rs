//! Configuration loading from `~/.thoughtstore/config.toml` with defaults.
//!
//! The `THOUGHTSTORE_DATABASE_URL` environment variable, when set, overrides
//! whatever connection string the file supplies.

use std::path::{Path, PathBuf};
use thoughtstore_types::config::{database_url_from_env, thoughtstore_home, StoreConfig};
use tracing::info;

/// Load store configuration from a TOML file, with defaults.
///
/// A missing, unreadable, or malformed file falls back to defaults with a
/// warning; the environment override applies either way.
pub fn load_config(path: Option<&Path>) -> StoreConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let mut config = read_config_file(&config_path);
    if let Some(url) = database_url_from_env() {
        config.database_url = url;
    }
    config
}

/// Parse one config file, ignoring the environment.
pub fn read_config_file(config_path: &Path) -> StoreConfig {
    if !config_path.exists() {
        return StoreConfig::default();
    }
    match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<StoreConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                StoreConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            StoreConfig::default()
        }
    }
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    thoughtstore_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_url = \"sqlite:///var/lib/thoughts.db\"").unwrap();
        writeln!(file, "read_retries = 5").unwrap();
        let config = read_config_file(file.path());
        assert_eq!(config.database_url, "sqlite:///var/lib/thoughts.db");
        assert_eq!(config.read_retries, 5);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_load_config_applies_env_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_url = \"sqlite:///var/lib/thoughts.db\"").unwrap();
        writeln!(file, "read_retries = 5").unwrap();
        let config = load_config(Some(file.path()));
        let expected =
            database_url_from_env().unwrap_or_else(|| "sqlite:///var/lib/thoughts.db".into());
        assert_eq!(config.database_url, expected);
        assert_eq!(config.read_retries, 5);
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "read_retries = \"many\"").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.read_retries, StoreConfig::default().read_retries);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.busy_timeout_ms, 5_000);
    }
}
