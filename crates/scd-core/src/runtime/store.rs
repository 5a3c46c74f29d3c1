// crates/scd-core/src/runtime/store.rs
// ============================================================================
// Module: SCD Operation Store
// Description: Get, search, upsert, and delete over any Operation backend.
// Purpose: Enforce ownership, optimistic versioning, and conflict visibility.
// Dependencies: crate::{core, interfaces, runtime::context}, time, tracing
// ============================================================================

//! ## Overview
//! [`OperationStore`] is the write protocol of the registry. Every upsert runs
//! inside a single backend transaction that:
//! 1. reads the current row and checks create/update intent, version, and owner;
//! 2. normalizes the time window;
//! 3. for Accepted/Activated Operations, requires the caller to present the
//!    current OVN of every other Operation intersecting the new volume;
//! 4. writes the row, replaces its Cell Index rows, and selects the
//!    Subscriptions to notify.
//!
//! Deletes recover the footprint from the Cell Index before removing the row,
//! so the notification set reflects what was actually stored.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use time::Duration;
use time::OffsetDateTime;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::core::CellSet;
use crate::core::MAX_COVERING_CELLS;
use crate::core::Operation;
use crate::core::OperationId;
use crate::core::Ovn;
use crate::core::Owner;
use crate::core::Subscription;
use crate::core::SubscriptionId;
use crate::core::SubscriptionRegistration;
use crate::core::Volume4D;
use crate::interfaces::Clock;
use crate::interfaces::OperationBackend;
use crate::interfaces::OperationSession;
use crate::interfaces::ScdError;
use crate::interfaces::StoreResultExt;
use crate::interfaces::SystemClock;
use crate::runtime::context::RequestContext;

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Result of a successful upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// Persisted Operation with its fresh version, OVN, and cells.
    pub operation: Operation,
    /// Subscriptions whose area of interest intersects the new cells.
    pub subscribers: Vec<Subscription>,
}

/// Result of a successful delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    /// Operation as it was stored before deletion, with its cells.
    pub operation: Operation,
    /// Subscriptions whose area of interest intersected the deleted cells.
    pub subscribers: Vec<Subscription>,
    /// Implicit Subscription removed along with the Operation, if any.
    pub removed_subscription: Option<SubscriptionId>,
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Operation record store over a transactional backend.
///
/// # Invariants
/// - Every write runs in one backend transaction; failures roll back.
/// - No Operation, cell, or Subscription data is cached between calls.
#[derive(Debug, Clone)]
pub struct OperationStore<B, C = SystemClock> {
    /// Backing storage engine.
    backend: B,
    /// Clock for last-write stamps and default start times.
    clock: C,
}

impl<B: OperationBackend> OperationStore<B> {
    /// Creates a store using the system clock.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            clock: SystemClock,
        }
    }
}

impl<B: OperationBackend, C: Clock> OperationStore<B, C> {
    /// Creates a store with an explicit clock.
    #[must_use]
    pub const fn with_clock(backend: B, clock: C) -> Self {
        Self {
            backend,
            clock,
        }
    }

    /// Returns the backing storage engine.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Fetches an Operation by id.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::NotFound`] when absent, or a store error.
    pub fn get(&self, ctx: &RequestContext, id: &OperationId) -> Result<Operation, ScdError> {
        debug!(operation_id = %id, "fetching operation");
        self.backend.read(ctx, |session| {
            ctx.ensure_active()?;
            session
                .fetch_operation(id)
                .context("error fetching operation")?
                .ok_or_else(|| not_found(id))
        })
    }

    /// Returns the cells recorded in the Cell Index for `id`.
    ///
    /// # Errors
    ///
    /// Returns a store error when the query fails.
    pub fn cells_of(&self, ctx: &RequestContext, id: &OperationId) -> Result<CellSet, ScdError> {
        self.backend.read(ctx, |session| {
            ctx.ensure_active()?;
            session.cells_of(id).context("error fetching operation cells")
        })
    }

    /// Returns the distinct Operations indexed under any of `cells`.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::BadRequest`] when `cells` exceeds
    /// [`MAX_COVERING_CELLS`], or a store error when the query fails.
    pub fn operations_intersecting(
        &self,
        ctx: &RequestContext,
        cells: &CellSet,
    ) -> Result<BTreeSet<OperationId>, ScdError> {
        ensure_covering_size(cells)?;
        self.backend.read(ctx, |session| {
            ctx.ensure_active()?;
            session.operations_intersecting(cells).context("error querying cell index")
        })
    }

    /// Returns every Operation intersecting `volume`, each at most once.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::BadRequest`] when the volume has no usable
    /// footprint, or a store error.
    pub fn search(
        &self,
        ctx: &RequestContext,
        volume: &Volume4D,
    ) -> Result<Vec<Operation>, ScdError> {
        let query = volume.resolve().map_err(|err| ScdError::BadRequest(err.to_string()))?;
        debug!(cells = query.cells.len(), "searching operations");
        self.backend.read(ctx, |session| {
            ctx.ensure_active()?;
            session.search_operations(&query).context("error searching operations")
        })
    }

    /// Creates or updates an Operation.
    ///
    /// `key` lists the OVNs the caller has observed; for Accepted/Activated
    /// Operations it must cover every other Operation intersecting the new
    /// volume. The Operation being updated is never part of its own conflict
    /// set, so `key` does not need to carry its own OVN; staleness of the
    /// record itself is caught by the `version` check instead.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::NotFound`], [`ScdError::AlreadyExists`],
    /// [`ScdError::VersionMismatch`], [`ScdError::PermissionDenied`],
    /// [`ScdError::BadRequest`], [`ScdError::MissingOvns`], or a store error.
    pub fn upsert(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        key: &[Ovn],
    ) -> Result<UpsertOutcome, ScdError> {
        let id = operation.id.clone();
        let now = self.clock.now();
        let result =
            self.backend.write(ctx, |session| upsert_in(session, ctx, operation, key, now));
        match &result {
            Ok(outcome) => info!(
                operation_id = %id,
                owner = %outcome.operation.owner,
                version = outcome.operation.version.value(),
                cells = outcome.operation.cells.len(),
                notify = outcome.subscribers.len(),
                "operation upserted"
            ),
            Err(err) => warn!(operation_id = %id, kind = err.kind(), error = %err, "operation upsert rejected"),
        }
        result
    }

    /// Deletes an Operation owned by `owner`.
    ///
    /// The implicit Subscription is removed too when no other Operation
    /// references it.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::NotFound`], [`ScdError::PermissionDenied`], or a
    /// store error.
    pub fn delete(
        &self,
        ctx: &RequestContext,
        id: &OperationId,
        owner: &Owner,
    ) -> Result<DeleteOutcome, ScdError> {
        let result = self.backend.write(ctx, |session| delete_in(session, ctx, id, owner));
        match &result {
            Ok(outcome) => info!(
                operation_id = %id,
                owner = %owner,
                notify = outcome.subscribers.len(),
                implicit_subscription_removed = outcome.removed_subscription.is_some(),
                "operation deleted"
            ),
            Err(err) => warn!(operation_id = %id, kind = err.kind(), error = %err, "operation delete rejected"),
        }
        result
    }

    /// Seeds a Subscription row and its cells.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::BadRequest`] when the covering exceeds
    /// [`MAX_COVERING_CELLS`], or a store error when the write fails.
    pub fn register_subscription(
        &self,
        ctx: &RequestContext,
        registration: &SubscriptionRegistration,
    ) -> Result<(), ScdError> {
        ensure_covering_size(&registration.cells)?;
        self.backend.write(ctx, |session| {
            ctx.ensure_active()?;
            session.register_subscription(registration).context("error registering subscription")
        })
    }

    /// Fetches a Subscription by id.
    ///
    /// # Errors
    ///
    /// Returns a store error when the query fails.
    pub fn subscription(
        &self,
        ctx: &RequestContext,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, ScdError> {
        self.backend.read(ctx, |session| {
            ctx.ensure_active()?;
            session.fetch_subscription(id).context("error fetching subscription")
        })
    }
}

// ============================================================================
// SECTION: Units of Work
// ============================================================================

/// Upsert state machine, run inside the write transaction.
fn upsert_in(
    session: &mut dyn OperationSession,
    ctx: &RequestContext,
    mut operation: Operation,
    key: &[Ovn],
    now: OffsetDateTime,
) -> Result<UpsertOutcome, ScdError> {
    ctx.ensure_active()?;
    let old = session.fetch_operation(&operation.id).context("error fetching operation by id")?;
    match &old {
        None if !operation.version.is_empty() => {
            return Err(not_found(&operation.id));
        }
        Some(_) if operation.version.is_empty() => {
            return Err(ScdError::AlreadyExists(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        Some(old) if !operation.version.matches(old.version) => {
            return Err(ScdError::VersionMismatch(format!(
                "operation {} is at version {}, not {}",
                operation.id, old.version, operation.version
            )));
        }
        Some(old) if old.owner != operation.owner => {
            return Err(owned_by_other(&operation.id));
        }
        _ => {}
    }

    operation
        .validate_time_range(now)
        .map_err(|err| ScdError::BadRequest(format!("invalid time range: {err}")))?;
    ensure_covering_size(&operation.cells)?;

    if operation.state.requires_key() {
        ensure_conflicts_acknowledged(session, ctx, &operation, key)?;
    }

    let updated_at = write_timestamp(now, old.as_ref().and_then(|old| old.updated_at));
    ctx.ensure_active()?;
    let mut stored =
        session.write_operation(&operation, updated_at).context("error upserting operation")?;
    stored.cells = operation.cells;

    ctx.ensure_active()?;
    session.replace_cells(&stored.id, &stored.cells).context("error replacing operation cells")?;

    ctx.ensure_active()?;
    let subscribers = session
        .subscriptions_for_notification(&stored.cells)
        .context("error fetching subscriptions for notification")?;

    Ok(UpsertOutcome {
        operation: stored,
        subscribers,
    })
}

/// Requires `key` to hold the OVN of every other Operation in the new volume.
fn ensure_conflicts_acknowledged(
    session: &mut dyn OperationSession,
    ctx: &RequestContext,
    operation: &Operation,
    key: &[Ovn],
) -> Result<(), ScdError> {
    let query = operation.volume().resolve().map_err(|err| ScdError::BadRequest(err.to_string()))?;
    ctx.ensure_active()?;
    let conflicts =
        session.search_operations(&query).context("error searching conflicting operations")?;

    let mut unmatched: BTreeSet<&Ovn> = key.iter().collect();
    let mut missing = Vec::new();
    for conflict in conflicts {
        if conflict.id == operation.id {
            continue;
        }
        let acknowledged = conflict.ovn.as_ref().is_some_and(|ovn| unmatched.remove(ovn));
        if !acknowledged {
            missing.push(conflict.id);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ScdError::MissingOvns {
            missing,
        })
    }
}

/// Delete sequence, run inside the write transaction.
fn delete_in(
    session: &mut dyn OperationSession,
    ctx: &RequestContext,
    id: &OperationId,
    owner: &Owner,
) -> Result<DeleteOutcome, ScdError> {
    ctx.ensure_active()?;
    let mut old = session
        .fetch_operation(id)
        .context("error fetching operation by id")?
        .ok_or_else(|| not_found(id))?;
    if old.owner != *owner {
        return Err(owned_by_other(id));
    }

    ctx.ensure_active()?;
    old.cells = session.cells_of(id).context("error populating operation cells")?;

    ctx.ensure_active()?;
    let subscribers = session
        .subscriptions_for_notification(&old.cells)
        .context("error fetching subscriptions for notification")?;

    ctx.ensure_active()?;
    session.delete_operation(id, owner).context("error deleting operation")?;

    let removed_subscription = match &old.subscription_id {
        Some(subscription_id) => {
            ctx.ensure_active()?;
            session
                .delete_implicit_subscription(subscription_id, owner)
                .context("error deleting implicit subscription")?
                .then(|| subscription_id.clone())
        }
        None => None,
    };

    Ok(DeleteOutcome {
        operation: old,
        subscribers,
        removed_subscription,
    })
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the last-write stamp for a write at `now`.
///
/// Stamps have microsecond resolution (the coarsest resolution among the
/// backends) and always move past the previous stamp, so every write changes
/// the OVN.
#[must_use]
pub fn write_timestamp(now: OffsetDateTime, previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let micros = now.nanosecond() / 1_000 * 1_000;
    let now = now.replace_nanosecond(micros).unwrap_or(now);
    match previous {
        Some(previous) if now <= previous => previous + Duration::microseconds(1),
        _ => now,
    }
}

/// Rejects coverings larger than one statement may bind.
fn ensure_covering_size(cells: &CellSet) -> Result<(), ScdError> {
    if cells.len() > MAX_COVERING_CELLS {
        return Err(ScdError::BadRequest(format!(
            "covering has {} cells, limit is {MAX_COVERING_CELLS}",
            cells.len()
        )));
    }
    Ok(())
}

/// Builds the not-found error for an Operation id.
fn not_found(id: &OperationId) -> ScdError {
    ScdError::NotFound(format!("operation {id} not found"))
}

/// Builds the ownership error for an Operation id.
fn owned_by_other(id: &OperationId) -> ScdError {
    ScdError::PermissionDenied(format!("operation {id} is owned by a different client"))
}
