//! Scheduler configuration
//!
//! Loads and validates scheduler settings from TOML files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// KV scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Capacity of the transaction queue
    #[serde(default = "default_txn_queue_capacity")]
    pub txn_queue_capacity: usize,

    /// Keep the history of processed transactions
    #[serde(default = "default_true")]
    pub record_transaction_history: bool,

    /// Age (minutes) after which recorded transactions and graph revisions are trimmed
    #[serde(default = "default_history_age_limit")]
    pub transaction_history_age_limit_mins: u64,

    /// Records created within this period (minutes) after start are never trimmed
    #[serde(default = "default_init_period")]
    pub permanently_recorded_init_period_mins: u64,

    /// Keep the per-key timeline of graph revisions
    #[serde(default = "default_true")]
    pub record_graph_revisions: bool,

    /// Log the formatted transaction at info level (debug otherwise)
    #[serde(default = "default_true")]
    pub print_txn_summary: bool,
}

fn default_txn_queue_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_history_age_limit() -> u64 {
    24 * 60
}

fn default_init_period() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            txn_queue_capacity: default_txn_queue_capacity(),
            record_transaction_history: default_true(),
            transaction_history_age_limit_mins: default_history_age_limit(),
            permanently_recorded_init_period_mins: default_init_period(),
            record_graph_revisions: default_true(),
            print_txn_summary: default_true(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Age limit of the transaction history and of graph revisions
    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(self.transaction_history_age_limit_mins.saturating_mul(60))
    }

    /// Period after start within which records are kept permanently
    pub fn permanent_init_period(&self) -> Duration {
        Duration::from_secs(self.permanently_recorded_init_period_mins.saturating_mul(60))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.txn_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "txn_queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.txn_queue_capacity, 100);
        assert!(config.record_transaction_history);
        assert_eq!(config.transaction_history_age_limit_mins, 1440);
        assert_eq!(config.permanently_recorded_init_period_mins, 60);
        assert_eq!(config.history_age_limit(), Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_age_limit_saturates() {
        let config = SchedulerConfig {
            transaction_history_age_limit_mins: u64::MAX,
            permanently_recorded_init_period_mins: u64::MAX / 2,
            ..Default::default()
        };
        assert_eq!(config.history_age_limit(), Duration::from_secs(u64::MAX));
        assert_eq!(config.permanent_init_period(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "txn_queue_capacity = 10").unwrap();
        writeln!(file, "print_txn_summary = false").unwrap();

        let config = SchedulerConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.txn_queue_capacity, 10);
        assert!(!config.print_txn_summary);
        assert!(config.record_graph_revisions);
    }

    #[test]
    fn test_load_missing_file() {
        let config = SchedulerConfig::load_or_default("/nonexistent/kvscheduler.conf").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "txn_queue_capacity = 0").unwrap();
        let err = SchedulerConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "txn_queue_capacity = \"many\"").unwrap();
        let err = SchedulerConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_save_and_reload() {
        let file = NamedTempFile::new().unwrap();
        let config = SchedulerConfig {
            record_graph_revisions: false,
            ..Default::default()
        };
        config.save(file.path()).unwrap();
        let loaded = SchedulerConfig::load_or_default(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
