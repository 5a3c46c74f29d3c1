// crates/scd-config/src/backend.rs
// ============================================================================
// Module: Configured Backend
// Description: Backend selected at runtime from configuration.
// Purpose: Let hosts open the Operation store without naming a backend type.
// Dependencies: scd-core, scd-store-sqlite, scd-store-postgres, tracing
// ============================================================================

//! ## Overview
//! [`ConfiguredBackend`] wraps whichever backend the `[store]` table selects
//! and forwards every unit of work to it unchanged.

// ============================================================================
// SECTION: Imports
// ============================================================================

use scd_core::OperationBackend;
use scd_core::OperationSession;
use scd_core::OperationStore;
use scd_core::RequestContext;
use scd_core::ScdError;
use scd_core::StoreError;
use scd_core::SystemClock;
use scd_store_postgres::PostgresOperationBackend;
use scd_store_sqlite::SqliteOperationBackend;
use tracing::info;

use crate::config::ScdConfig;
use crate::config::StoreConfig;

// ============================================================================
// SECTION: Backend
// ============================================================================

/// Operation backend chosen by configuration.
pub enum ConfiguredBackend {
    /// Embedded `SQLite` backend.
    Sqlite(SqliteOperationBackend),
    /// Postgres backend.
    Postgres(PostgresOperationBackend),
}

/// Operation store over the configured backend.
pub type ConfiguredStore<C = SystemClock> = OperationStore<ConfiguredBackend, C>;

impl ConfiguredBackend {
    /// Opens the backend described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backend cannot be opened or its schema
    /// version is unsupported.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend = match config {
            StoreConfig::Sqlite(sqlite) => Self::Sqlite(SqliteOperationBackend::new(sqlite)?),
            StoreConfig::Postgres(postgres) => {
                Self::Postgres(PostgresOperationBackend::new(postgres)?)
            }
        };
        info!(backend = config.backend_name(), "operation store backend ready");
        Ok(backend)
    }
}

impl OperationBackend for ConfiguredBackend {
    fn read<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        match self {
            Self::Sqlite(backend) => backend.read(ctx, work),
            Self::Postgres(backend) => backend.read(ctx, work),
        }
    }

    fn write<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        match self {
            Self::Sqlite(backend) => backend.write(ctx, work),
            Self::Postgres(backend) => backend.write(ctx, work),
        }
    }
}

impl ScdConfig {
    /// Opens an Operation store on the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the backend cannot be opened.
    pub fn open_store(&self) -> Result<ConfiguredStore, StoreError> {
        Ok(OperationStore::new(ConfiguredBackend::open(&self.store)?))
    }
}
