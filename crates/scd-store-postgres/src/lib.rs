// crates/scd-store-postgres/src/lib.rs
// ============================================================================
// Module: Postgres Operation Store
// Description: Pooled Operation backend for Postgres-compatible servers.
// Purpose: Provide shared server persistence for the SCD Operation store.
// Dependencies: scd-core, postgres, r2d2
// ============================================================================

//! ## Overview
//! This crate provides a Postgres-backed [`scd_core::OperationBackend`].
//! Connections come from an `r2d2` pool; write units of work run in a
//! `SERIALIZABLE` transaction and cell predicates use native `BIGINT[]`
//! arrays. Serialization failures reported by the server are surfaced as
//! store errors for the caller to retry.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod session;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::PostgresOperationBackend;
pub use store::PostgresOperationStore;
pub use store::PostgresStoreConfig;
pub use store::PostgresStoreError;
