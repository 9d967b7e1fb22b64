//! Ledger configuration
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (`saneledger.toml`, `.yaml` or `.json` in the working directory, or an
//! explicit path), then environment variables such as
//! `SANELEDGER__BALTOP__UPDATE_INTERVAL_SECS=60`.
//!
//! ```toml
//! multi_server_sync = true
//!
//! [backend]
//! kind = "sqlite"
//! path = "economy.db"
//!
//! [baltop]
//! update_interval_secs = 300
//! ```

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::LedgerError;

/// Largest supported currency precision
pub const MAX_DECIMALS: u32 = 8;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: BackendConfig,
    pub baltop: BaltopConfig,
    /// Broadcast invalidations to, and accept them from, other servers
    pub multi_server_sync: bool,
    pub economy: EconomyConfig,
    pub currency: CurrencyConfig,
    pub flush: FlushConfig,
    pub log: LogConfig,
}

/// Which storage engine holds balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// CSV file, for small economies
    Flatfile { path: PathBuf },
    /// SQLite database with a connection pool
    Sqlite {
        path: PathBuf,
        /// Defaults to the number of CPUs, capped by the backend
        #[serde(default)]
        pool_size: Option<usize>,
    },
    /// Nothing is kept once the process exits
    Memory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Flatfile {
            path: PathBuf::from("economy.csv"),
        }
    }
}

/// Balance leaderboard settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaltopConfig {
    pub update_interval_secs: u64,
    /// How many entries each refresh fetches
    pub size: usize,
}

impl Default for BaltopConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 300,
            size: 100,
        }
    }
}

impl BaltopConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

/// Transaction policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub allow_overdraft: bool,
    pub allow_self_transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    /// Decimal places an amount may carry
    pub decimals: u32,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self { decimals: 2 }
    }
}

/// Write flusher tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Most accounts written per backend call
    pub batch_size: usize,
    /// Attempts per batch before it is reported as failed
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_attempts: 5,
            backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
    /// Append every transaction to this CSV file
    pub transactions: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            transactions: None,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from defaults, a file and the environment
    ///
    /// # Arguments
    ///
    /// * `path` - Explicit configuration file; it must exist. Without one,
    ///   `saneledger.{toml,yaml,json}` is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self, LedgerError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("saneledger").required(false),
        };

        let config: LedgerConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("SANELEDGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.baltop.update_interval_secs == 0 {
            return Err(LedgerError::config("baltop.update_interval_secs must be > 0"));
        }
        if self.baltop.size == 0 {
            return Err(LedgerError::config("baltop.size must be > 0"));
        }
        if self.flush.batch_size == 0 {
            return Err(LedgerError::config("flush.batch_size must be > 0"));
        }
        if self.flush.max_attempts == 0 {
            return Err(LedgerError::config("flush.max_attempts must be > 0"));
        }
        if self.currency.decimals > MAX_DECIMALS {
            return Err(LedgerError::config(format!(
                "currency.decimals must be <= {}",
                MAX_DECIMALS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.baltop.update_interval(), Duration::from_secs(300));
        assert!(!config.economy.allow_overdraft);
        assert!(!config.multi_server_sync);
        assert_eq!(config.currency.decimals, 2);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml");
        fs::write(
            &path,
            r#"
multi_server_sync = true

[backend]
kind = "sqlite"
path = "economy.db"
pool_size = 3

[baltop]
update_interval_secs = 60

[economy]
allow_overdraft = true
"#,
        )
        .unwrap();

        let config = LedgerConfig::load(Some(&path)).unwrap();

        assert!(config.multi_server_sync);
        assert!(config.economy.allow_overdraft);
        assert_eq!(config.baltop.update_interval_secs, 60);
        assert_eq!(config.baltop.size, 100);
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite {
                path: PathBuf::from("economy.db"),
                pool_size: Some(3),
            }
        );
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = LedgerConfig::load(Some(&dir.path().join("missing.toml")));

        assert!(matches!(result, Err(LedgerError::Config { .. })));
    }

    #[rstest]
    #[case::zero_interval(|c: &mut LedgerConfig| c.baltop.update_interval_secs = 0)]
    #[case::zero_size(|c: &mut LedgerConfig| c.baltop.size = 0)]
    #[case::zero_batch(|c: &mut LedgerConfig| c.flush.batch_size = 0)]
    #[case::zero_attempts(|c: &mut LedgerConfig| c.flush.max_attempts = 0)]
    #[case::too_many_decimals(|c: &mut LedgerConfig| c.currency.decimals = 9)]
    fn test_validate_rejects(#[case] mutate: fn(&mut LedgerConfig)) {
        let mut config = LedgerConfig::default();
        mutate(&mut config);

        assert!(matches!(config.validate(), Err(LedgerError::Config { .. })));
    }
}
