// crates/scd-store-postgres/src/session.rs
// ============================================================================
// Module: Postgres Operation Session
// Description: Statements and row mapping for one Postgres unit of work.
// Purpose: Implement the Operation session contract over an open transaction.
// Dependencies: scd-core, postgres, time
// ============================================================================

//! ## Overview
//! Cell predicates bind the covering as one `BIGINT[]` parameter and use
//! `= ANY` / `!= ALL`, so statement text does not depend on the covering
//! size. Timestamps use `TIMESTAMPTZ`; the OVN is derived from `updated_at`
//! when a row is read back.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use postgres::Row;
use postgres::Transaction;
use scd_core::CellId;
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

use crate::store::PostgresStoreError;

// ============================================================================
// SECTION: Statements
// ============================================================================

/// Operation columns in row-mapping order.
const OPERATION_FIELDS: &str = "id, owner, version, url, altitude_lower, altitude_upper, \
                                starts_at, ends_at, subscription_id, state, updated_at";

/// Subscription columns in row-mapping order.
const SUBSCRIPTION_FIELDS: &str =
    "id, owner, url, notification_index, implicit, starts_at, ends_at";

/// Cell join table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellTable {
    /// `scd_cells_operations`.
    Operations,
    /// `scd_cells_subscriptions`.
    Subscriptions,
}

impl CellTable {
    /// Returns the table name.
    const fn name(self) -> &'static str {
        match self {
            Self::Operations => "scd_cells_operations",
            Self::Subscriptions => "scd_cells_subscriptions",
        }
    }

    /// Returns the owning record column.
    const fn key_column(self) -> &'static str {
        match self {
            Self::Operations => "operation_id",
            Self::Subscriptions => "subscription_id",
        }
    }

    /// Upserts every `(cell, level)` pair from two parallel arrays.
    fn upsert_sql(self) -> String {
        let (name, column) = (self.name(), self.key_column());
        format!(
            "INSERT INTO {name} (cell_id, cell_level, {column})
             SELECT cell, level, $3::TEXT FROM UNNEST($1::BIGINT[], $2::INTEGER[]) AS c (cell, level)
             ON CONFLICT (cell_id, {column}) DO UPDATE SET cell_level = EXCLUDED.cell_level"
        )
    }

    /// Deletes rows not covered by the new footprint (all rows when it is empty).
    fn prune_sql(self) -> String {
        let (name, column) = (self.name(), self.key_column());
        format!("DELETE FROM {name} WHERE {column} = $1 AND cell_id != ALL($2)")
    }
}

/// Bounded cell search.
fn search_sql() -> String {
    format!(
        "SELECT {OPERATION_FIELDS} FROM scd_operations
         WHERE id IN (SELECT operation_id FROM scd_cells_operations WHERE cell_id = ANY($1))
         AND COALESCE(altitude_upper >= $2, true)
         AND COALESCE(altitude_lower <= $3, true)
         AND COALESCE(ends_at >= $4, true)
         AND COALESCE(starts_at <= $5, true)
         ORDER BY id"
    )
}

/// Operation upsert with `version = COALESCE(old, 0) + 1`.
fn upsert_operation_sql() -> String {
    format!(
        "INSERT INTO scd_operations ({OPERATION_FIELDS})
         VALUES (
             $1, $2, COALESCE((SELECT version FROM scd_operations WHERE id = $1), 0) + 1,
             $3, $4, $5, $6, $7, $8, $9, $10
         )
         ON CONFLICT (id) DO UPDATE SET
             version = EXCLUDED.version,
             url = EXCLUDED.url,
             altitude_lower = EXCLUDED.altitude_lower,
             altitude_upper = EXCLUDED.altitude_upper,
             starts_at = EXCLUDED.starts_at,
             ends_at = EXCLUDED.ends_at,
             subscription_id = EXCLUDED.subscription_id,
             state = EXCLUDED.state,
             updated_at = EXCLUDED.updated_at
         RETURNING {OPERATION_FIELDS}"
    )
}

/// Notification index bump for Subscriptions intersecting a covering.
fn notify_sql() -> String {
    format!(
        "UPDATE scd_subscriptions SET notification_index = notification_index + 1
         WHERE id IN (
             SELECT subscription_id FROM scd_cells_subscriptions WHERE cell_id = ANY($1)
         )
         RETURNING {SUBSCRIPTION_FIELDS}"
    )
}

/// Returns parallel cell id and level arrays for binding.
fn cell_params(cells: &CellSet) -> (Vec<i64>, Vec<i32>) {
    cells.iter().map(|cell| (cell.to_sql(), i32::from(cell.level()))).unzip()
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// Maps a row selected with [`OPERATION_FIELDS`], deriving the OVN.
fn operation_from_row(row: &Row) -> Result<Operation, PostgresStoreError> {
    let id = OperationId::new(row.try_get::<_, String>(0)?);
    let state: String = row.try_get(9)?;
    let state = OperationState::parse(&state).ok_or_else(|| {
        PostgresStoreError::Corrupt(format!("operation {id} has unknown state {state}"))
    })?;
    let updated_at: OffsetDateTime = row.try_get(10)?;
    Ok(Operation {
        ovn: Some(Ovn::from_time(updated_at, &id)),
        owner: Owner::new(row.try_get::<_, String>(1)?),
        version: Version::new(row.try_get(2)?),
        uss_base_url: row.try_get(3)?,
        altitude_lower: row.try_get(4)?,
        altitude_upper: row.try_get(5)?,
        start_time: row.try_get(6)?,
        end_time: row.try_get(7)?,
        subscription_id: row.try_get::<_, Option<String>>(8)?.map(SubscriptionId::new),
        state,
        cells: CellSet::new(),
        updated_at: Some(updated_at),
        id,
    })
}

/// Maps a row selected with [`SUBSCRIPTION_FIELDS`].
fn subscription_from_row(row: &Row) -> Result<Subscription, PostgresStoreError> {
    Ok(Subscription {
        id: SubscriptionId::new(row.try_get::<_, String>(0)?),
        owner: Owner::new(row.try_get::<_, String>(1)?),
        uss_base_url: row.try_get(2)?,
        notification_index: row.try_get(3)?,
        implicit: row.try_get(4)?,
        start_time: row.try_get(5)?,
        end_time: row.try_get(6)?,
    })
}

/// Returns the only element of `rows`, failing when there are several.
fn single<T>(rows: Vec<T>, what: &str) -> Result<Option<T>, PostgresStoreError> {
    let mut rows = rows.into_iter();
    let first = rows.next();
    if rows.next().is_some() {
        return Err(PostgresStoreError::Corrupt(format!("multiple rows for {what}")));
    }
    Ok(first)
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Operation session bound to an open Postgres transaction.
pub(crate) struct PostgresSession<'a, 'c> {
    /// Enclosing transaction.
    tx: &'a mut Transaction<'c>,
}

impl<'a, 'c> PostgresSession<'a, 'c> {
    /// Wraps an open transaction.
    pub(crate) const fn new(tx: &'a mut Transaction<'c>) -> Self {
        Self {
            tx,
        }
    }

    /// Fetches at most one Operation row.
    fn fetch(&mut self, id: &OperationId) -> Result<Option<Operation>, PostgresStoreError> {
        let sql = format!("SELECT {OPERATION_FIELDS} FROM scd_operations WHERE id = $1");
        let rows = self.tx.query(sql.as_str(), &[&id.as_str()])?;
        let operations =
            rows.iter().map(operation_from_row).collect::<Result<Vec<_>, _>>()?;
        single(operations, &format!("operation {id}"))
    }

    /// Returns the distinct Operations indexed in any of `cells`.
    fn intersecting(&mut self, cells: &CellSet) -> Result<BTreeSet<OperationId>, PostgresStoreError> {
        if cells.is_empty() {
            return Ok(BTreeSet::new());
        }
        let rows = self.tx.query(
            "SELECT DISTINCT operation_id FROM scd_cells_operations WHERE cell_id = ANY($1)",
            &[&cells.sql_ids()],
        )?;
        rows.iter()
            .map(|row| -> Result<OperationId, PostgresStoreError> {
                Ok(OperationId::new(row.try_get::<_, String>(0)?))
            })
            .collect()
    }

    /// Runs the bounded cell search.
    fn search(&mut self, query: &CellQuery) -> Result<Vec<Operation>, PostgresStoreError> {
        if query.cells.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.tx.query(
            search_sql().as_str(),
            &[
                &query.cells.sql_ids(),
                &query.altitude_lo,
                &query.altitude_hi,
                &query.start_time,
                &query.end_time,
            ],
        )?;
        rows.iter().map(operation_from_row).collect()
    }

    /// Upserts the Operation row and returns it as persisted.
    fn upsert(
        &mut self,
        operation: &Operation,
        updated_at: OffsetDateTime,
    ) -> Result<Operation, PostgresStoreError> {
        let row = self.tx.query_one(
            upsert_operation_sql().as_str(),
            &[
                &operation.id.as_str(),
                &operation.owner.as_str(),
                &operation.uss_base_url,
                &operation.altitude_lower,
                &operation.altitude_upper,
                &operation.start_time,
                &operation.end_time,
                &operation.subscription_id.as_ref().map(SubscriptionId::as_str),
                &operation.state.as_str(),
                &updated_at,
            ],
        )?;
        operation_from_row(&row)
    }

    /// Makes the cell rows for `key` exactly equal `cells`.
    fn replace(
        &mut self,
        table: CellTable,
        key: &str,
        cells: &CellSet,
    ) -> Result<(), PostgresStoreError> {
        let (ids, levels) = cell_params(cells);
        if !ids.is_empty() {
            self.tx.execute(table.upsert_sql().as_str(), &[&ids, &levels, &key])?;
        }
        self.tx.execute(table.prune_sql().as_str(), &[&key, &ids])?;
        Ok(())
    }

    /// Returns the cells indexed for Operation `id`.
    fn cells(&mut self, id: &OperationId) -> Result<CellSet, PostgresStoreError> {
        let rows = self.tx.query(
            "SELECT cell_id FROM scd_cells_operations WHERE operation_id = $1 ORDER BY cell_id",
            &[&id.as_str()],
        )?;
        rows.iter()
            .map(|row| -> Result<CellId, PostgresStoreError> {
                Ok(CellId::from_sql(row.try_get(0)?))
            })
            .collect()
    }

    /// Bumps and returns every Subscription intersecting `cells`.
    fn notify(&mut self, cells: &CellSet) -> Result<Vec<Subscription>, PostgresStoreError> {
        if cells.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.tx.query(notify_sql().as_str(), &[&cells.sql_ids()])?;
        let mut subscriptions =
            rows.iter().map(subscription_from_row).collect::<Result<Vec<_>, _>>()?;
        subscriptions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subscriptions)
    }

    /// Deletes the owner's Operation row and its cells.
    fn delete(&mut self, id: &OperationId, owner: &Owner) -> Result<(), PostgresStoreError> {
        self.tx.execute(
            "DELETE FROM scd_cells_operations WHERE operation_id IN (
                 SELECT id FROM scd_operations WHERE id = $1 AND owner = $2
             )",
            &[&id.as_str(), &owner.as_str()],
        )?;
        self.tx.execute(
            "DELETE FROM scd_operations WHERE id = $1 AND owner = $2",
            &[&id.as_str(), &owner.as_str()],
        )?;
        Ok(())
    }

    /// Deletes an unreferenced implicit Subscription.
    fn delete_implicit(
        &mut self,
        id: &SubscriptionId,
        owner: &Owner,
    ) -> Result<bool, PostgresStoreError> {
        let removed = self.tx.execute(
            "DELETE FROM scd_subscriptions
             WHERE id = $1 AND owner = $2 AND implicit
             AND 0 = (SELECT COUNT(*) FROM scd_operations WHERE subscription_id = $1)",
            &[&id.as_str(), &owner.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Fetches at most one Subscription row.
    fn subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, PostgresStoreError> {
        let sql = format!("SELECT {SUBSCRIPTION_FIELDS} FROM scd_subscriptions WHERE id = $1");
        let rows = self.tx.query(sql.as_str(), &[&id.as_str()])?;
        let subscriptions =
            rows.iter().map(subscription_from_row).collect::<Result<Vec<_>, _>>()?;
        single(subscriptions, &format!("subscription {id}"))
    }

    /// Upserts a Subscription row and replaces its cells.
    fn register(
        &mut self,
        registration: &SubscriptionRegistration,
    ) -> Result<(), PostgresStoreError> {
        let subscription = &registration.subscription;
        let sql = format!(
            "INSERT INTO scd_subscriptions ({SUBSCRIPTION_FIELDS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                     owner = EXCLUDED.owner,
                     url = EXCLUDED.url,
                     notification_index = EXCLUDED.notification_index,
                     implicit = EXCLUDED.implicit,
                     starts_at = EXCLUDED.starts_at,
                     ends_at = EXCLUDED.ends_at"
        );
        self.tx.execute(
            sql.as_str(),
            &[
                &subscription.id.as_str(),
                &subscription.owner.as_str(),
                &subscription.uss_base_url,
                &subscription.notification_index,
                &subscription.implicit,
                &subscription.start_time,
                &subscription.end_time,
            ],
        )?;
        self.replace(CellTable::Subscriptions, subscription.id.as_str(), &registration.cells)
    }
}

impl OperationSession for PostgresSession<'_, '_> {
    fn fetch_operation(&mut self, id: &OperationId) -> Result<Option<Operation>, StoreError> {
        Ok(self.fetch(id)?)
    }

    fn operations_intersecting(
        &mut self,
        cells: &CellSet,
    ) -> Result<BTreeSet<OperationId>, StoreError> {
        Ok(self.intersecting(cells)?)
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
        Ok(self.replace(CellTable::Operations, id.as_str(), cells)?)
    }

    fn cells_of(&mut self, id: &OperationId) -> Result<CellSet, StoreError> {
        Ok(self.cells(id)?)
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
        Ok(self.subscription(id)?)
    }

    fn register_subscription(
        &mut self,
        registration: &SubscriptionRegistration,
    ) -> Result<(), StoreError> {
        Ok(self.register(registration)?)
    }
}

#[cfg(test)]
mod tests {
    use scd_core::CellSet;

    use super::CellTable;
    use super::cell_params;
    use super::search_sql;
    use super::single;
    use super::upsert_operation_sql;

    #[test]
    fn cell_params_use_signed_ids_and_levels() {
        let cells: CellSet = [1_u64, 0xB000_0000_0000_0000].into_iter().collect();
        let (ids, levels) = cell_params(&cells);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], 1);
        assert!(ids[1] < 0);
        assert_eq!(levels, vec![30, 0]);
    }

    #[test]
    fn cell_predicates_bind_arrays() {
        assert!(search_sql().contains("cell_id = ANY($1)"));
        assert!(CellTable::Operations.prune_sql().contains("cell_id != ALL($2)"));
        assert!(CellTable::Subscriptions.upsert_sql().contains("scd_cells_subscriptions"));
    }

    #[test]
    fn upsert_does_not_rewrite_owner() {
        let sql = upsert_operation_sql();
        let update = sql.split("DO UPDATE SET").nth(1).unwrap_or_default();
        assert!(!update.contains("owner"));
        assert!(sql.contains("COALESCE((SELECT version FROM scd_operations WHERE id = $1), 0) + 1"));
    }

    #[test]
    fn single_rejects_duplicate_rows() {
        assert_eq!(single(vec![1], "row").ok(), Some(Some(1)));
        assert_eq!(single(Vec::<i32>::new(), "row").ok(), Some(None));
        assert!(single(vec![1, 2], "row").is_err());
    }
}
