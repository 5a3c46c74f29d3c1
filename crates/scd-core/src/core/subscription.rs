// crates/scd-core/src/core/subscription.rs
// ============================================================================
// Module: SCD Subscriptions
// Description: Read model of the externally owned Subscription table.
// Purpose: Describe who must be notified when Operations change.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Subscriptions are owned by a separate store. The Operation store only
//! reads them to build notification lists, bumps their notification index,
//! and deletes implicit Subscriptions when their last Operation goes away.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::core::cells::CellSet;
use crate::core::identifiers::Owner;
use crate::core::identifiers::SubscriptionId;

// ============================================================================
// SECTION: Subscription
// ============================================================================

/// Subscription to be notified of Operation changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Registering operator.
    pub owner: Owner,
    /// Callback base URL for notifications.
    pub uss_base_url: String,
    /// Count of notifications issued; bumped each time the Subscription is selected.
    pub notification_index: i64,
    /// Whether the Subscription is managed on behalf of a single Operation.
    pub implicit: bool,
    /// Start of the area of interest window.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    /// End of the area of interest window.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

/// Subscription row plus the covering of its area of interest.
///
/// Used to seed the Subscription table that the Operation store reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRegistration {
    /// Subscription row.
    pub subscription: Subscription,
    /// Covering of the area of interest.
    pub cells: CellSet,
}
