// crates/scd-core/src/interfaces/mod.rs
// ============================================================================
// Module: SCD Interfaces
// Description: Backend-agnostic interfaces for storage, time, and errors.
// Purpose: Define the contracts the Operation store consumes from collaborators.
// Dependencies: crate::{core, runtime::context}, thiserror, time
// ============================================================================

//! ## Overview
//! The Operation store is written against these interfaces rather than a
//! concrete database. A backend hands out an [`OperationSession`] for one
//! unit of work; write sessions are atomic, so every statement issued through
//! a session either commits together or not at all.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use thiserror::Error;
use time::OffsetDateTime;

use crate::core::CellQuery;
use crate::core::CellSet;
use crate::core::Operation;
use crate::core::OperationId;
use crate::core::Owner;
use crate::core::Subscription;
use crate::core::SubscriptionId;
use crate::core::SubscriptionRegistration;
use crate::runtime::RequestContext;

// ============================================================================
// SECTION: Store Errors
// ============================================================================

/// Backing store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Store I/O or connectivity error.
    #[error("operation store io error: {0}")]
    Io(String),
    /// Store engine reported an error.
    #[error("operation store db error: {0}")]
    Db(String),
    /// Store data violates an invariant.
    #[error("operation store corruption: {0}")]
    Corrupt(String),
    /// Store schema version is incompatible.
    #[error("operation store version mismatch: {0}")]
    VersionMismatch(String),
    /// Store data is invalid.
    #[error("operation store invalid data: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Caller Errors
// ============================================================================

/// Errors returned by [`crate::OperationStore`] operations.
///
/// # Invariants
/// - Every variant except [`ScdError::Store`] and [`ScdError::Cancelled`] is a
///   caller-correctable condition and is never retried by the store.
#[derive(Debug, Error)]
pub enum ScdError {
    /// The Operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A create targeted an existing Operation.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The supplied version does not match the stored version.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
    /// The caller does not own the record.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The request is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The caller has not acknowledged every conflicting Operation.
    #[error("missing OVNs for conflicting operations: {}", join_ids(.missing))]
    MissingOvns {
        /// Conflicting Operations whose current OVN was not supplied.
        missing: Vec<OperationId>,
    },
    /// The request context was cancelled or timed out.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The backing store failed.
    #[error("{context}: {source}")]
    Store {
        /// Step that failed.
        context: &'static str,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
}

impl ScdError {
    /// Returns a stable label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::VersionMismatch(_) => "version_mismatch",
            Self::PermissionDenied(_) => "permission_denied",
            Self::BadRequest(_) => "bad_request",
            Self::MissingOvns {
                ..
            } => "missing_ovns",
            Self::Cancelled(_) => "cancelled",
            Self::Store {
                ..
            } => "internal",
        }
    }
}

/// Joins operation ids for error messages.
fn join_ids(ids: &[OperationId]) -> String {
    ids.iter().map(OperationId::as_str).collect::<Vec<_>>().join(", ")
}

/// Annotates backend results with the store step that produced them.
pub trait StoreResultExt<T> {
    /// Wraps a [`StoreError`] as [`ScdError::Store`] with `context`.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::Store`] when the result is an error.
    fn context(self, context: &'static str) -> Result<T, ScdError>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn context(self, context: &'static str) -> Result<T, ScdError> {
        self.map_err(|source| ScdError::Store {
            context,
            source,
        })
    }
}

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Source of wall-clock time for last-write stamps and default start times.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the system UTC time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

// ============================================================================
// SECTION: Backend Session
// ============================================================================

/// One unit of work against the backing store.
///
/// Sessions obtained from [`OperationBackend::write`] are transactional: the
/// backend commits them only when the unit of work succeeds.
pub trait OperationSession {
    /// Fetches an Operation row by id, deriving its OVN.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or matches more than one row.
    fn fetch_operation(&mut self, id: &OperationId) -> Result<Option<Operation>, StoreError>;

    /// Returns the distinct Operations whose Cell Index rows intersect `cells`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn operations_intersecting(
        &mut self,
        cells: &CellSet,
    ) -> Result<BTreeSet<OperationId>, StoreError>;

    /// Returns deduplicated Operations matching the cells, altitude, and time bounds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn search_operations(&mut self, query: &CellQuery) -> Result<Vec<Operation>, StoreError>;

    /// Upserts the Operation row with `version = COALESCE(old, 0) + 1`.
    ///
    /// Returns the persisted row; its `cells` field is not populated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn write_operation(
        &mut self,
        operation: &Operation,
        updated_at: OffsetDateTime,
    ) -> Result<Operation, StoreError>;

    /// Makes the Cell Index rows for `id` exactly equal `cells`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn replace_cells(&mut self, id: &OperationId, cells: &CellSet) -> Result<(), StoreError>;

    /// Returns the Cell Index footprint recorded for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn cells_of(&mut self, id: &OperationId) -> Result<CellSet, StoreError>;

    /// Returns Subscriptions intersecting `cells`, bumping their notification index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn subscriptions_for_notification(
        &mut self,
        cells: &CellSet,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Deletes the Operation row owned by `owner` along with its Cell Index rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete_operation(&mut self, id: &OperationId, owner: &Owner) -> Result<(), StoreError>;

    /// Deletes the Subscription when it is implicit, owned by `owner`, and no
    /// Operation references it any longer. Returns `true` when a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete_implicit_subscription(
        &mut self,
        id: &SubscriptionId,
        owner: &Owner,
    ) -> Result<bool, StoreError>;

    /// Fetches a Subscription row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn fetch_subscription(&mut self, id: &SubscriptionId)
    -> Result<Option<Subscription>, StoreError>;

    /// Inserts or replaces a Subscription row and its cells.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn register_subscription(
        &mut self,
        registration: &SubscriptionRegistration,
    ) -> Result<(), StoreError>;
}

/// Storage engine able to run units of work.
///
/// Both entry points take the caller's [`RequestContext`]. Lock waits and
/// statements run on its behalf stop at its deadline, and a failure caused by
/// the context stopping is reported as [`ScdError::Cancelled`].
pub trait OperationBackend {
    /// Runs `work` against a consistent read session.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work`, [`ScdError::Cancelled`] when
    /// `ctx` stops first, or [`ScdError::Store`] when the session cannot be
    /// opened.
    fn read<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>;

    /// Runs `work` inside one atomic transaction, committing only on success.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work` (after rolling back),
    /// [`ScdError::Cancelled`] when `ctx` stops first, or [`ScdError::Store`]
    /// when the transaction cannot begin or commit.
    fn write<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>;
}
