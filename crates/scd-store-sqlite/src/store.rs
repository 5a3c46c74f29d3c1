// crates/scd-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Operation Backend
// Description: Connection management, schema, and transactions for SQLite.
// Purpose: Run Operation store units of work against a SQLite database.
// Dependencies: scd-core, rusqlite, serde, thiserror, tracing
// ============================================================================

//! ## Overview
//! This module opens and initializes the `SQLite` database and implements
//! [`OperationBackend`]. Read units of work run in a deferred transaction so
//! they see one snapshot; write units of work run in an immediate transaction
//! and commit only when the unit of work succeeds.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use scd_core::OperationBackend;
use scd_core::OperationSession;
use scd_core::OperationStore;
use scd_core::RequestContext;
use scd_core::ScdError;
use scd_core::StoreError;
use scd_core::StoreResultExt;
use scd_core::SystemClock;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::session::SqliteSession;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Virtual machine instructions between cancellation checks.
const PROGRESS_CHECK_INTERVAL: i32 = 1_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` Operation backend.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `busy_timeout_ms` bounds how long a writer waits for the write lock.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Creates a configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Stored data violates an invariant.
    #[error("sqlite store corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

impl From<SqliteStoreError> for StoreError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::Io(message) => Self::Io(message),
            SqliteStoreError::Db(message) => Self::Db(message),
            SqliteStoreError::Corrupt(message) => Self::Corrupt(message),
            SqliteStoreError::VersionMismatch(message) => Self::VersionMismatch(message),
            SqliteStoreError::Invalid(message) => Self::Invalid(message),
        }
    }
}

// ============================================================================
// SECTION: Backend
// ============================================================================

/// `SQLite`-backed Operation backend.
///
/// # Invariants
/// - Connection access is serialized through a mutex.
/// - Write transactions begin `IMMEDIATE`, so they hold the write lock
///   from the version check through commit.
/// - Each unit of work waits for database locks no longer than its request
///   context allows, and its statements are interrupted once the context
///   stops.
#[derive(Debug, Clone)]
pub struct SqliteOperationBackend {
    /// Shared `SQLite` connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
    /// Configured upper bound on lock waits.
    busy_timeout: Duration,
}

/// Operation store running on `SQLite`.
pub type SqliteOperationStore<C = SystemClock> = OperationStore<SqliteOperationBackend, C>;

impl SqliteOperationBackend {
    /// Opens an `SQLite`-backed Operation backend, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        info!(path = %config.path.display(), "opened sqlite operation store");
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        })
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection.lock().map_err(|_| StoreError::Db("mutex poisoned".to_string()))
    }

    /// Runs `work` in a transaction bounded by `ctx`.
    fn run<T, F>(
        &self,
        ctx: &RequestContext,
        behavior: TransactionBehavior,
        step: Steps,
        work: F,
    ) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        ctx.ensure_active()?;
        let mut guard = self.lock().context(step.begin)?;
        ctx.ensure_active()?;
        bind_context(&guard, ctx, self.busy_timeout).context(step.begin)?;
        let result = run_transaction(&mut guard, behavior, step, work);
        let released = release_context(&guard, self.busy_timeout).context(step.finish);
        drop(guard);
        let value = result.map_err(|err| ctx.attribute(err))?;
        released?;
        Ok(value)
    }
}

/// Error contexts for the two ends of a unit of work.
#[derive(Clone, Copy)]
struct Steps {
    /// Context for failures opening the transaction.
    begin: &'static str,
    /// Context for failures closing the transaction.
    finish: &'static str,
}

/// Steps reported by read units of work.
const READ_STEPS: Steps = Steps {
    begin: "error opening read session",
    finish: "error closing read session",
};

/// Steps reported by write units of work.
const WRITE_STEPS: Steps = Steps {
    begin: "error beginning transaction",
    finish: "error committing transaction",
};

impl OperationBackend for SqliteOperationBackend {
    fn read<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        self.run(ctx, TransactionBehavior::Deferred, READ_STEPS, work)
    }

    fn write<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        self.run(ctx, TransactionBehavior::Immediate, WRITE_STEPS, work)
    }
}

/// Opens the transaction, runs `work`, and commits only on success.
fn run_transaction<T, F>(
    connection: &mut Connection,
    behavior: TransactionBehavior,
    step: Steps,
    work: F,
) -> Result<T, ScdError>
where
    F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
{
    let tx = connection
        .transaction_with_behavior(behavior)
        .map_err(|err| StoreError::Db(err.to_string()))
        .context(step.begin)?;
    let value = work(&mut SqliteSession::new(&tx))?;
    tx.commit().map_err(|err| StoreError::Db(err.to_string())).context(step.finish)?;
    Ok(value)
}

/// Caps lock waits at the request budget and interrupts statements once the
/// request stops.
fn bind_context(
    connection: &Connection,
    ctx: &RequestContext,
    busy_timeout: Duration,
) -> Result<(), StoreError> {
    let db = |err: rusqlite::Error| StoreError::Db(err.to_string());
    connection.busy_timeout(ctx.budget(busy_timeout)).map_err(db)?;
    let watched = ctx.clone();
    let interrupt = move || watched.ensure_active().is_err();
    connection.progress_handler(PROGRESS_CHECK_INTERVAL, Some(interrupt)).map_err(db)
}

/// Restores the configured lock wait and removes the interrupt check.
fn release_context(connection: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
    let db = |err: rusqlite::Error| StoreError::Db(err.to_string());
    connection.progress_handler(0, None::<fn() -> bool>).map_err(db)?;
    connection.busy_timeout(busy_timeout).map_err(db)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection with secure defaults.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteStoreConfig,
) -> Result<(), SqliteStoreError> {
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    connection.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS scd_operations (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    altitude_lower REAL,
                    altitude_upper REAL,
                    starts_at INTEGER,
                    ends_at INTEGER,
                    subscription_id TEXT,
                    state TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_scd_operations_subscription_id
                    ON scd_operations (subscription_id);
                CREATE TABLE IF NOT EXISTS scd_cells_operations (
                    cell_id INTEGER NOT NULL,
                    cell_level INTEGER NOT NULL,
                    operation_id TEXT NOT NULL,
                    PRIMARY KEY (cell_id, operation_id),
                    FOREIGN KEY (operation_id) REFERENCES scd_operations(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_scd_cells_operations_operation_id
                    ON scd_cells_operations (operation_id);
                CREATE TABLE IF NOT EXISTS scd_subscriptions (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    url TEXT NOT NULL,
                    notification_index INTEGER NOT NULL DEFAULT 0,
                    implicit INTEGER NOT NULL,
                    starts_at INTEGER,
                    ends_at INTEGER
                );
                CREATE TABLE IF NOT EXISTS scd_cells_subscriptions (
                    cell_id INTEGER NOT NULL,
                    cell_level INTEGER NOT NULL,
                    subscription_id TEXT NOT NULL,
                    PRIMARY KEY (cell_id, subscription_id),
                    FOREIGN KEY (subscription_id) REFERENCES scd_subscriptions(id) ON DELETE CASCADE
                );",
            )?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}
