// crates/scd-core/src/runtime/mod.rs
// ============================================================================
// Module: SCD Runtime
// Description: Operation store runtime and bundled backends.
// Purpose: Enforce the write protocol over any backend.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! The runtime hosts the [`OperationStore`], which implements get, search,
//! upsert, and delete over an [`crate::OperationBackend`], the
//! [`RequestContext`] used to cancel in-flight work, and an in-memory backend
//! for tests and demos.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod context;
pub mod memory;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use context::RequestContext;
pub use memory::InMemoryBackend;
pub use store::DeleteOutcome;
pub use store::OperationStore;
pub use store::UpsertOutcome;
pub use store::write_timestamp;
