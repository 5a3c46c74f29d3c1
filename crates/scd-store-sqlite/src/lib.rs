// crates/scd-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Operation Store
// Description: Durable Operation backend using SQLite WAL.
// Purpose: Provide embedded persistence for the SCD Operation store.
// Dependencies: scd-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`scd_core::OperationBackend`] that
//! persists Operations, their Cell Index rows, and the Subscription rows the
//! store reads. Writes take the database write lock up front
//! (`BEGIN IMMEDIATE`), so concurrent writers to the same record serialize
//! and the loser observes the winner's version.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod cell_index;
mod session;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteOperationBackend;
pub use store::SqliteOperationStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
