// crates/scd-core/src/core/operation.rs
// ============================================================================
// Module: SCD Operation Records
// Description: Operation entity, lifecycle states, and time-range validation.
// Purpose: Define the record persisted by the Operation store.
// Dependencies: serde, time, thiserror
// ============================================================================

//! ## Overview
//! An Operation is a registered flight intent: a cell covering of its
//! footprint, an altitude band, a time window, and a lifecycle state, owned
//! by exactly one operator. The `ovn` and `updated_at` fields are filled by
//! the store on read; callers leave them unset when submitting a write.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::core::cells::CellSet;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::Owner;
use crate::core::identifiers::SubscriptionId;
use crate::core::ovn::Ovn;
use crate::core::version::Version;
use crate::core::volume::Volume3D;
use crate::core::volume::Volume4D;

// ============================================================================
// SECTION: Operation State
// ============================================================================

/// Lifecycle state of an Operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    /// Accepted by the operator, not yet flying.
    Accepted,
    /// Flying within its declared volume.
    Activated,
    /// Flying outside its declared volume.
    NonConforming,
    /// Out of control; volume is best effort.
    Contingent,
    /// Finished.
    Ended,
}

impl OperationState {
    /// Returns `true` for states that require acknowledging every conflict.
    #[must_use]
    pub const fn requires_key(self) -> bool {
        matches!(self, Self::Accepted | Self::Activated)
    }

    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Activated => "Activated",
            Self::NonConforming => "NonConforming",
            Self::Contingent => "Contingent",
            Self::Ended => "Ended",
        }
    }

    /// Parses a persisted label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "Accepted" => Some(Self::Accepted),
            "Activated" => Some(Self::Activated),
            "NonConforming" => Some(Self::NonConforming),
            "Contingent" => Some(Self::Contingent),
            "Ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Operation
// ============================================================================

/// Registered 4D flight intent.
///
/// # Invariants
/// - `id` and `owner` never change after creation.
/// - `ovn` is derived from `updated_at` and `id` on every read; it is never stored.
/// - `cells` on a stored Operation equals its Cell Index rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Stable operation identifier.
    pub id: OperationId,
    /// Registering operator.
    pub owner: Owner,
    /// Optimistic-concurrency version (empty on create).
    #[serde(default)]
    pub version: Version,
    /// Version token derived at read time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn: Option<Ovn>,
    /// Base URL of the owning operator's callback API.
    pub uss_base_url: String,
    /// Lower altitude bound in meters (`None` = unbounded).
    #[serde(default)]
    pub altitude_lower: Option<f64>,
    /// Upper altitude bound in meters (`None` = unbounded).
    #[serde(default)]
    pub altitude_upper: Option<f64>,
    /// Start of the time window (`None` = unbounded).
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    /// End of the time window (`None` = unbounded).
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    /// Subscription whose notifications the owner receives.
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    /// Lifecycle state.
    pub state: OperationState,
    /// Covering of the footprint.
    #[serde(default)]
    pub cells: CellSet,
    /// Last-write timestamp assigned by the store.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Time-range validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeRangeError {
    /// The Operation has no end time.
    #[error("operation must have an end time")]
    MissingEnd,
    /// The end time precedes the start time.
    #[error("operation end time must not precede its start time")]
    EndBeforeStart,
}

impl Operation {
    /// Validates and normalizes the time window before a write.
    ///
    /// A missing start time is set to `now`; a missing end time or an end
    /// before the start is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`TimeRangeError`] when the window is unusable.
    pub fn validate_time_range(&mut self, now: OffsetDateTime) -> Result<(), TimeRangeError> {
        let start = *self.start_time.get_or_insert(now);
        let Some(end) = self.end_time else {
            return Err(TimeRangeError::MissingEnd);
        };
        if end < start {
            return Err(TimeRangeError::EndBeforeStart);
        }
        Ok(())
    }

    /// Returns the 4D volume this Operation occupies, footprinted by its cells.
    #[must_use]
    pub fn volume(&self) -> Volume4D {
        Volume4D {
            start_time: self.start_time,
            end_time: self.end_time,
            spatial_volume: Some(Volume3D {
                altitude_lo: self.altitude_lower,
                altitude_hi: self.altitude_upper,
                footprint: Some(Arc::new(self.cells.clone())),
            }),
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
