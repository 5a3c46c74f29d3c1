// crates/scd-config/src/config.rs
// ============================================================================
// Module: SCD Configuration
// Description: Configuration model, loading, and validation.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: scd-store-sqlite, scd-store-postgres, serde, toml
// ============================================================================

//! ## Overview
//! The configuration file is TOML. Loading enforces a size cap and UTF-8
//! before parsing, and every loaded configuration is validated. Backend
//! settings reuse the backend crates' own config types.
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = "/var/lib/scd/scd.sqlite"
//! journal_mode = "wal"
//! ```

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use scd_store_postgres::PostgresStoreConfig;
use scd_store_sqlite::SqliteStoreConfig;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "scd.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "SCD_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Upper bound for any configured timeout (ms).
const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
/// Upper bound for the Postgres pool size.
const MAX_POOL_SIZE: u32 = 1_024;

// ============================================================================
// SECTION: Model
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScdConfig {
    /// Backing store selection and settings.
    pub store: StoreConfig,
}

/// Backing store selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Embedded `SQLite` database.
    Sqlite(SqliteStoreConfig),
    /// Postgres-compatible server.
    Postgres(PostgresStoreConfig),
}

impl StoreConfig {
    /// Returns the backend label used in logs.
    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Validates backend settings.
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Sqlite(config) => {
                validate_path_string("store.path", &config.path.to_string_lossy())?;
                validate_timeout("store.busy_timeout_ms", config.busy_timeout_ms)
            }
            Self::Postgres(config) => {
                if config.connection.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "store.connection must be non-empty".to_string(),
                    ));
                }
                if config.max_connections == 0 || config.max_connections > MAX_POOL_SIZE {
                    return Err(ConfigError::Invalid(format!(
                        "store.max_connections must be between 1 and {MAX_POOL_SIZE}"
                    )));
                }
                validate_timeout("store.connect_timeout_ms", config.connect_timeout_ms)?;
                validate_timeout("store.statement_timeout_ms", config.statement_timeout_ms)
            }
        }
    }
}

impl ScdConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// The path is `path` when given, else `$SCD_CONFIG`, else `scd.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::parse(content)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config exceeds size limit".to_string()));
        }
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from the argument or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates a timeout in milliseconds.
fn validate_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_TIMEOUT_MS {
        return Err(ConfigError::Invalid(format!(
            "{field} must be between 1 and {MAX_TIMEOUT_MS}"
        )));
    }
    Ok(())
}
