// crates/scd-core/src/lib.rs
// ============================================================================
// Module: SCD Core Library
// Description: Public API surface for the SCD Operation store core.
// Purpose: Expose core types, collaborator interfaces, and the Operation store.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! SCD core provides the Operation record store used for strategic conflict
//! detection: typed Operation and Subscription records, the version token
//! (OVN) derivation, the Cell Index contract, and the backend-agnostic
//! [`OperationStore`] that enforces ownership, optimistic versioning, and the
//! conflict-visibility rule before every write. Storage engines plug in
//! through [`OperationBackend`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::Clock;
pub use interfaces::OperationBackend;
pub use interfaces::OperationSession;
pub use interfaces::ScdError;
pub use interfaces::StoreError;
pub use interfaces::StoreResultExt;
pub use interfaces::SystemClock;
pub use runtime::DeleteOutcome;
pub use runtime::InMemoryBackend;
pub use runtime::OperationStore;
pub use runtime::RequestContext;
pub use runtime::UpsertOutcome;
