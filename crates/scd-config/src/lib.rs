// crates/scd-config/src/lib.rs
// ============================================================================
// Module: SCD Config
// Description: Configuration loading and backend selection.
// Purpose: Turn a TOML file into a ready-to-use Operation store.
// Dependencies: scd-core, scd-store-sqlite, scd-store-postgres, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits
//! and validated before use. The `[store]` table selects the backend;
//! [`ConfiguredBackend`] opens whichever one the file names.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod backend;
pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use backend::ConfiguredBackend;
pub use backend::ConfiguredStore;
pub use config::ConfigError;
pub use config::ScdConfig;
pub use config::StoreConfig;
