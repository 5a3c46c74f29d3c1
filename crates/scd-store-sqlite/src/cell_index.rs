// crates/scd-store-sqlite/src/cell_index.rs
// ============================================================================
// Module: SQLite Cell Index
// Description: Cell join-table maintenance and intersection queries.
// Purpose: Keep each record's cell rows equal to its footprint.
// Dependencies: scd-core, rusqlite
// ============================================================================

//! ## Overview
//! Operations and Subscriptions each own a cell join table keyed by
//! `(cell_id, <record>_id)`. A replace upserts every cell of the new footprint
//! with its level, then removes rows the footprint no longer covers. Cell ids
//! are stored in their signed SQL form.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use rusqlite::Connection;
use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use scd_core::CellId;
use scd_core::CellSet;
use scd_core::OperationId;

use crate::store::SqliteStoreError;

// ============================================================================
// SECTION: Tables
// ============================================================================

/// Cell join table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellTable {
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
}

// ============================================================================
// SECTION: Writes
// ============================================================================

/// Makes the cell rows for `key` in `table` exactly equal `cells`.
pub(crate) fn replace_cells(
    conn: &Connection,
    table: CellTable,
    key: &str,
    cells: &CellSet,
) -> Result<(), SqliteStoreError> {
    let name = table.name();
    let column = table.key_column();
    if cells.is_empty() {
        conn.execute(&format!("DELETE FROM {name} WHERE {column} = ?1"), params![key])?;
        return Ok(());
    }
    let mut upsert = conn.prepare(&format!(
        "INSERT INTO {name} (cell_id, cell_level, {column}) VALUES (?1, ?2, ?3)
         ON CONFLICT (cell_id, {column}) DO UPDATE SET cell_level = excluded.cell_level"
    ))?;
    for cell in cells {
        upsert.execute(params![cell.to_sql(), i64::from(cell.level()), key])?;
    }
    let sql = format!(
        "DELETE FROM {name} WHERE {column} = ?1 AND cell_id NOT IN ({})",
        placeholders(2, cells.len())
    );
    let mut values = vec![Value::Text(key.to_string())];
    values.extend(cell_values(cells));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Returns the cells indexed for Operation `id`.
pub(crate) fn operation_cells(
    conn: &Connection,
    id: &OperationId,
) -> Result<CellSet, SqliteStoreError> {
    let mut statement = conn.prepare(
        "SELECT cell_id FROM scd_cells_operations WHERE operation_id = ?1 ORDER BY cell_id",
    )?;
    let rows = statement.query_map(params![id.as_str()], |row| row.get::<_, i64>(0))?;
    let mut cells = CellSet::new();
    for row in rows {
        cells.insert(CellId::from_sql(row?));
    }
    Ok(cells)
}

/// Returns the distinct Operations with at least one cell in `cells`.
pub(crate) fn operations_intersecting(
    conn: &Connection,
    cells: &CellSet,
) -> Result<BTreeSet<OperationId>, SqliteStoreError> {
    if cells.is_empty() {
        return Ok(BTreeSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT operation_id FROM scd_cells_operations WHERE cell_id IN ({})",
        placeholders(1, cells.len())
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(cell_values(cells)), |row| {
        row.get::<_, String>(0)
    })?;
    let mut ids = BTreeSet::new();
    for row in rows {
        ids.insert(OperationId::new(row?));
    }
    Ok(ids)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns `count` numbered placeholders starting at `?first`.
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first .. first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

/// Returns the cells as SQL integer values.
pub(crate) fn cell_values(cells: &CellSet) -> impl Iterator<Item = Value> + '_ {
    cells.iter().map(|cell| Value::Integer(cell.to_sql()))
}

#[cfg(test)]
mod tests {
    use super::placeholders;

    #[test]
    fn placeholders_are_numbered_from_offset() {
        assert_eq!(placeholders(1, 3), "?1, ?2, ?3");
        assert_eq!(placeholders(5, 1), "?5");
        assert_eq!(placeholders(2, 0), "");
    }
}
