// crates/scd-core/src/core/mod.rs
// ============================================================================
// Module: SCD Core Types
// Description: Canonical Operation, Subscription, and spatial index records.
// Purpose: Provide stable, serializable types shared by every store backend.
// Dependencies: serde, time, sha2, base64
// ============================================================================

//! ## Overview
//! SCD core types define Operations (4D volumes owned by one operator), the
//! Subscriptions notified when they change, hierarchical cell identifiers,
//! and the version tokens used for optimistic concurrency.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod cells;
pub mod identifiers;
pub mod operation;
pub mod ovn;
pub mod subscription;
pub mod version;
pub mod volume;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use cells::CellId;
pub use cells::CellSet;
pub use cells::MAX_CELL_LEVEL;
pub use cells::MAX_COVERING_CELLS;
pub use identifiers::OperationId;
pub use identifiers::Owner;
pub use identifiers::SubscriptionId;
pub use operation::Operation;
pub use operation::OperationState;
pub use operation::TimeRangeError;
pub use ovn::Ovn;
pub use subscription::Subscription;
pub use subscription::SubscriptionRegistration;
pub use version::Version;
pub use volume::CellQuery;
pub use volume::Footprint;
pub use volume::GeometryError;
pub use volume::Volume3D;
pub use volume::Volume4D;
