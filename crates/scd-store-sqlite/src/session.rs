// crates/scd-store-sqlite/src/session.rs
// ============================================================================
// Module: SQLite Operation Session
// Description: Row mapping and statements for one SQLite unit of work.
// Purpose: Implement the Operation session contract over an open transaction.
// Dependencies: scd-core, rusqlite, time
// ============================================================================

//! ## Overview
//! A session borrows the connection of an open transaction. Timestamps are
//! stored as integer Unix nanoseconds; the OVN is derived from `updated_at`
//! whenever a row is read back, so it is never persisted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use rusqlite::Connection;
use rusqlite::Row;
use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use scd_core::CellQuery;
use scd_core::CellSet;
use scd_core::Operation;
use scd_core::OperationId;
use scd_core::OperationSession;
use scd_core::OperationState;
use scd_core::Ovn;
use scd_core::Owner;
use scd_core::StoreError;
use scd_core::Subscription;
use scd_core::SubscriptionId;
use scd_core::SubscriptionRegistration;
use scd_core::Version;
use time::OffsetDateTime;

use crate::cell_index;
use crate::cell_index::CellTable;
use crate::store::SqliteStoreError;

// ============================================================================
// SECTION: Columns
// ============================================================================

/// Operation columns in row-mapping order.
const OPERATION_FIELDS: &str = "id, owner, version, url, altitude_lower, altitude_upper, \
                                starts_at, ends_at, subscription_id, state, updated_at";

/// Subscription columns in row-mapping order.
const SUBSCRIPTION_FIELDS: &str =
    "id, owner, url, notification_index, implicit, starts_at, ends_at";

// ============================================================================
// SECTION: Rows
// ============================================================================

/// Raw `scd_operations` row.
struct OperationRow {
    /// Operation id.
    id: String,
    /// Owner.
    owner: String,
    /// Stored version.
    version: i64,
    /// USS base URL.
    url: String,
    /// Lower altitude bound.
    altitude_lower: Option<f64>,
    /// Upper altitude bound.
    altitude_upper: Option<f64>,
    /// Start time in Unix nanoseconds.
    starts_at: Option<i64>,
    /// End time in Unix nanoseconds.
    ends_at: Option<i64>,
    /// Linked Subscription id.
    subscription_id: Option<String>,
    /// State label.
    state: String,
    /// Last-write stamp in Unix nanoseconds.
    updated_at: i64,
}

impl OperationRow {
    /// Reads a row selected with [`OPERATION_FIELDS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            version: row.get(2)?,
            url: row.get(3)?,
            altitude_lower: row.get(4)?,
            altitude_upper: row.get(5)?,
            starts_at: row.get(6)?,
            ends_at: row.get(7)?,
            subscription_id: row.get(8)?,
            state: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    /// Converts the raw row into the read model, deriving the OVN.
    fn into_operation(self) -> Result<Operation, SqliteStoreError> {
        let id = OperationId::new(self.id);
        let state = OperationState::parse(&self.state).ok_or_else(|| {
            SqliteStoreError::Corrupt(format!("operation {id} has unknown state {}", self.state))
        })?;
        let updated_at = from_nanos(self.updated_at)?;
        Ok(Operation {
            ovn: Some(Ovn::from_time(updated_at, &id)),
            owner: Owner::new(self.owner),
            version: Version::new(self.version),
            uss_base_url: self.url,
            altitude_lower: self.altitude_lower,
            altitude_upper: self.altitude_upper,
            start_time: self.starts_at.map(from_nanos).transpose()?,
            end_time: self.ends_at.map(from_nanos).transpose()?,
            subscription_id: self.subscription_id.map(SubscriptionId::new),
            state,
            cells: CellSet::new(),
            updated_at: Some(updated_at),
            id,
        })
    }
}

/// Raw `scd_subscriptions` row.
struct SubscriptionRow {
    /// Subscription id.
    id: String,
    /// Owner.
    owner: String,
    /// Callback base URL.
    url: String,
    /// Notification index.
    notification_index: i64,
    /// Implicit flag.
    implicit: bool,
    /// Start time in Unix nanoseconds.
    starts_at: Option<i64>,
    /// End time in Unix nanoseconds.
    ends_at: Option<i64>,
}

impl SubscriptionRow {
    /// Reads a row selected with [`SUBSCRIPTION_FIELDS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            url: row.get(2)?,
            notification_index: row.get(3)?,
            implicit: row.get(4)?,
            starts_at: row.get(5)?,
            ends_at: row.get(6)?,
        })
    }

    /// Converts the raw row into the read model.
    fn into_subscription(self) -> Result<Subscription, SqliteStoreError> {
        Ok(Subscription {
            id: SubscriptionId::new(self.id),
            owner: Owner::new(self.owner),
            uss_base_url: self.url,
            notification_index: self.notification_index,
            implicit: self.implicit,
            start_time: self.starts_at.map(from_nanos).transpose()?,
            end_time: self.ends_at.map(from_nanos).transpose()?,
        })
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Operation session bound to an open `SQLite` transaction.
pub(crate) struct SqliteSession<'c> {
    /// Connection of the enclosing transaction.
    conn: &'c Connection,
}

impl<'c> SqliteSession<'c> {
    /// Wraps the connection of an open transaction.
    pub(crate) const fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
        }
    }

    /// Fetches at most one Operation row.
    fn fetch(&self, id: &OperationId) -> Result<Option<Operation>, SqliteStoreError> {
        let mut statement =
            self.conn.prepare(&format!("SELECT {OPERATION_FIELDS} FROM scd_operations WHERE id = ?1"))?;
        let rows = statement
            .query_map(params![id.as_str()], OperationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = rows.into_iter();
        let first = rows.next();
        if rows.next().is_some() {
            return Err(SqliteStoreError::Corrupt(format!("multiple rows for operation {id}")));
        }
        first.map(OperationRow::into_operation).transpose()
    }

    /// Runs the bounded cell search.
    fn search(&self, query: &CellQuery) -> Result<Vec<Operation>, SqliteStoreError> {
        if query.cells.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {OPERATION_FIELDS} FROM scd_operations
             WHERE id IN (
                 SELECT operation_id FROM scd_cells_operations WHERE cell_id IN ({})
             )
             AND COALESCE(altitude_upper >= ?1, 1)
             AND COALESCE(altitude_lower <= ?2, 1)
             AND COALESCE(ends_at >= ?3, 1)
             AND COALESCE(starts_at <= ?4, 1)
             ORDER BY id",
            cell_index::placeholders(5, query.cells.len())
        );
        let mut values = vec![
            optional_real(query.altitude_lo),
            optional_real(query.altitude_hi),
            optional_time(query.start_time)?,
            optional_time(query.end_time)?,
        ];
        values.extend(cell_index::cell_values(&query.cells));
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(values), OperationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    /// Upserts the Operation row and returns it as persisted.
    fn upsert(
        &self,
        operation: &Operation,
        updated_at: OffsetDateTime,
    ) -> Result<Operation, SqliteStoreError> {
        let sql = format!(
            "INSERT INTO scd_operations ({OPERATION_FIELDS})
             VALUES (
                 ?1, ?2, COALESCE((SELECT version FROM scd_operations WHERE id = ?1), 0) + 1,
                 ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
             )
             ON CONFLICT (id) DO UPDATE SET
                 version = excluded.version,
                 url = excluded.url,
                 altitude_lower = excluded.altitude_lower,
                 altitude_upper = excluded.altitude_upper,
                 starts_at = excluded.starts_at,
                 ends_at = excluded.ends_at,
                 subscription_id = excluded.subscription_id,
                 state = excluded.state,
                 updated_at = excluded.updated_at
             RETURNING {OPERATION_FIELDS}"
        );
        let row = self.conn.query_row(
            &sql,
            params![
                operation.id.as_str(),
                operation.owner.as_str(),
                operation.uss_base_url,
                operation.altitude_lower,
                operation.altitude_upper,
                operation.start_time.map(to_nanos).transpose()?,
                operation.end_time.map(to_nanos).transpose()?,
                operation.subscription_id.as_ref().map(SubscriptionId::as_str),
                operation.state.as_str(),
                to_nanos(updated_at)?,
            ],
            OperationRow::from_row,
        )?;
        row.into_operation()
    }

    /// Bumps and returns every Subscription intersecting `cells`.
    fn notify(&self, cells: &CellSet) -> Result<Vec<Subscription>, SqliteStoreError> {
        if cells.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE scd_subscriptions SET notification_index = notification_index + 1
             WHERE id IN (
                 SELECT subscription_id FROM scd_cells_subscriptions WHERE cell_id IN ({})
             )
             RETURNING {SUBSCRIPTION_FIELDS}",
            cell_index::placeholders(1, cells.len())
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement
            .query_map(params_from_iter(cell_index::cell_values(cells)), SubscriptionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut subscriptions = rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect::<Result<Vec<_>, _>>()?;
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subscriptions)
    }

    /// Deletes the owner's Operation row and its cells.
    fn delete(&self, id: &OperationId, owner: &Owner) -> Result<(), SqliteStoreError> {
        self.conn.execute(
            "DELETE FROM scd_cells_operations WHERE operation_id IN (
                 SELECT id FROM scd_operations WHERE id = ?1 AND owner = ?2
             )",
            params![id.as_str(), owner.as_str()],
        )?;
        self.conn.execute(
            "DELETE FROM scd_operations WHERE id = ?1 AND owner = ?2",
            params![id.as_str(), owner.as_str()],
        )?;
        Ok(())
    }

    /// Deletes an unreferenced implicit Subscription.
    fn delete_implicit(
        &self,
        id: &SubscriptionId,
        owner: &Owner,
    ) -> Result<bool, SqliteStoreError> {
        let removed = self.conn.execute(
            "DELETE FROM scd_subscriptions
             WHERE id = ?1 AND owner = ?2 AND implicit = 1
             AND 0 = (SELECT COUNT(*) FROM scd_operations WHERE subscription_id = ?1)",
            params![id.as_str(), owner.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Fetches at most one Subscription row.
    fn fetch_subscription_row(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, SqliteStoreError> {
        let mut statement = self
            .conn
            .prepare(&format!("SELECT {SUBSCRIPTION_FIELDS} FROM scd_subscriptions WHERE id = ?1"))?;
        let rows = statement
            .query_map(params![id.as_str()], SubscriptionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = rows.into_iter();
        let first = rows.next();
        if rows.next().is_some() {
            return Err(SqliteStoreError::Corrupt(format!("multiple rows for subscription {id}")));
        }
        first.map(SubscriptionRow::into_subscription).transpose()
    }

    /// Upserts a Subscription row and replaces its cells.
    fn register(&self, registration: &SubscriptionRegistration) -> Result<(), SqliteStoreError> {
        let subscription = &registration.subscription;
        self.conn.execute(
            &format!(
                "INSERT INTO scd_subscriptions ({SUBSCRIPTION_FIELDS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO UPDATE SET
                     owner = excluded.owner,
                     url = excluded.url,
                     notification_index = excluded.notification_index,
                     implicit = excluded.implicit,
                     starts_at = excluded.starts_at,
                     ends_at = excluded.ends_at"
            ),
            params![
                subscription.id.as_str(),
                subscription.owner.as_str(),
                subscription.uss_base_url,
                subscription.notification_index,
                subscription.implicit,
                subscription.start_time.map(to_nanos).transpose()?,
                subscription.end_time.map(to_nanos).transpose()?,
            ],
        )?;
        cell_index::replace_cells(
            self.conn,
            CellTable::Subscriptions,
            subscription.id.as_str(),
            &registration.cells,
        )
    }
}

impl OperationSession for SqliteSession<'_> {
    fn fetch_operation(&mut self, id: &OperationId) -> Result<Option<Operation>, StoreError> {
        Ok(self.fetch(id)?)
    }

    fn operations_intersecting(
        &mut self,
        cells: &CellSet,
    ) -> Result<BTreeSet<OperationId>, StoreError> {
        Ok(cell_index::operations_intersecting(self.conn, cells)?)
    }

    fn search_operations(&mut self, query: &CellQuery) -> Result<Vec<Operation>, StoreError> {
        Ok(self.search(query)?)
    }

    fn write_operation(
        &mut self,
        operation: &Operation,
        updated_at: OffsetDateTime,
    ) -> Result<Operation, StoreError> {
        Ok(self.upsert(operation, updated_at)?)
    }

    fn replace_cells(&mut self, id: &OperationId, cells: &CellSet) -> Result<(), StoreError> {
        Ok(cell_index::replace_cells(self.conn, CellTable::Operations, id.as_str(), cells)?)
    }

    fn cells_of(&mut self, id: &OperationId) -> Result<CellSet, StoreError> {
        Ok(cell_index::operation_cells(self.conn, id)?)
    }

    fn subscriptions_for_notification(
        &mut self,
        cells: &CellSet,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.notify(cells)?)
    }

    fn delete_operation(&mut self, id: &OperationId, owner: &Owner) -> Result<(), StoreError> {
        Ok(self.delete(id, owner)?)
    }

    fn delete_implicit_subscription(
        &mut self,
        id: &SubscriptionId,
        owner: &Owner,
    ) -> Result<bool, StoreError> {
        Ok(self.delete_implicit(id, owner)?)
    }

    fn fetch_subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.fetch_subscription_row(id)?)
    }

    fn register_subscription(
        &mut self,
        registration: &SubscriptionRegistration,
    ) -> Result<(), StoreError> {
        Ok(self.register(registration)?)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts a timestamp to Unix nanoseconds.
fn to_nanos(value: OffsetDateTime) -> Result<i64, SqliteStoreError> {
    i64::try_from(value.unix_timestamp_nanos())
        .map_err(|_| SqliteStoreError::Invalid(format!("timestamp out of range: {value}")))
}

/// Converts stored Unix nanoseconds back to a timestamp.
fn from_nanos(value: i64) -> Result<OffsetDateTime, SqliteStoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|err| SqliteStoreError::Corrupt(format!("stored timestamp {value}: {err}")))
}

/// Binds an optional altitude.
fn optional_real(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Real)
}

/// Binds an optional timestamp.
fn optional_time(value: Option<OffsetDateTime>) -> Result<Value, SqliteStoreError> {
    Ok(value.map(to_nanos).transpose()?.map_or(Value::Null, Value::Integer))
}
