// crates/scd-core/src/core/cells.rs
// ============================================================================
// Module: SCD Cells
// Description: Hierarchical sphere-subdivision cell identifiers and sets.
// Purpose: Provide the unit of the spatial Cell Index.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Cells are nodes of a hierarchical subdivision of the sphere using the S2
//! bit layout: the position of the lowest set bit encodes the subdivision
//! level. The store never computes coverings itself; it only persists and
//! intersects the cell identifiers produced by the geometry service.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::collections::btree_set;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Cell Identifier
// ============================================================================

/// Deepest subdivision level of the cell hierarchy.
pub const MAX_CELL_LEVEL: u8 = 30;
/// Largest covering accepted for a write or search.
///
/// Backends bind one parameter per cell, and this stays well under the
/// `SQLite` host parameter limit.
pub const MAX_COVERING_CELLS: usize = 10_000;

/// Identifier of a single hierarchical cell.
///
/// # Invariants
/// - The SQL form is the bit-identical `i64` reinterpretation of the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(u64);

impl CellId {
    /// Creates a cell identifier from its raw 64-bit form.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the subdivision level implied by the lowest set bit.
    #[must_use]
    pub fn level(self) -> u8 {
        let depth = self.0.trailing_zeros() / 2;
        let level = u32::from(MAX_CELL_LEVEL).saturating_sub(depth);
        u8::try_from(level).unwrap_or(0)
    }

    /// Returns the identifier as stored in signed 64-bit SQL columns.
    #[must_use]
    pub const fn to_sql(self) -> i64 {
        self.0.cast_signed()
    }

    /// Rebuilds an identifier from its signed 64-bit SQL form.
    #[must_use]
    pub const fn from_sql(value: i64) -> Self {
        Self(value.cast_unsigned())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for CellId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Cell Set
// ============================================================================

/// Ordered, deduplicated collection of cells (a covering).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellSet(BTreeSet<CellId>);

impl CellSet {
    /// Creates an empty cell set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Inserts a cell, returning `true` when it was not already present.
    pub fn insert(&mut self, cell: CellId) -> bool {
        self.0.insert(cell)
    }

    /// Returns `true` when the cell is a member of the set.
    #[must_use]
    pub fn contains(&self, cell: CellId) -> bool {
        self.0.contains(&cell)
    }

    /// Returns the number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the set holds no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates cells in ascending id order.
    pub fn iter(&self) -> btree_set::Iter<'_, CellId> {
        self.0.iter()
    }

    /// Returns `true` when the two sets share at least one cell.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let (small, large) = if self.len() <= other.len() { (self, other) } else { (other, self) };
        small.iter().any(|cell| large.contains(*cell))
    }

    /// Returns the signed SQL form of every cell, in ascending id order.
    #[must_use]
    pub fn sql_ids(&self) -> Vec<i64> {
        self.0.iter().map(|cell| cell.to_sql()).collect()
    }
}

impl FromIterator<CellId> for CellSet {
    fn from_iter<I: IntoIterator<Item = CellId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<u64> for CellSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().map(CellId::new).collect())
    }
}

impl<'a> IntoIterator for &'a CellSet {
    type IntoIter = btree_set::Iter<'a, CellId>;
    type Item = &'a CellId;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for CellSet {
    type IntoIter = btree_set::IntoIter<CellId>;
    type Item = CellId;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::CellId;
    use super::CellSet;
    use super::MAX_CELL_LEVEL;

    #[test]
    fn leaf_cells_report_max_level() {
        assert_eq!(CellId::new(0b1011).level(), MAX_CELL_LEVEL);
        assert_eq!(CellId::new(10).level(), MAX_CELL_LEVEL);
    }

    #[test]
    fn lowest_set_bit_drives_level() {
        assert_eq!(CellId::new(1 << 2).level(), 29);
        assert_eq!(CellId::new(1 << 20).level(), 20);
        assert_eq!(CellId::new(1 << 60).level(), 0);
        assert_eq!(CellId::new(0).level(), 0);
    }

    #[test]
    fn sql_form_preserves_high_bit() {
        let cell = CellId::new(0x8900_0000_0000_0001);
        assert!(cell.to_sql() < 0);
        assert_eq!(CellId::from_sql(cell.to_sql()), cell);
    }

    #[test]
    fn cell_sets_dedupe_and_intersect() {
        let a: CellSet = [10_u64, 11, 11].into_iter().collect();
        let b: CellSet = [11_u64, 12].into_iter().collect();
        let c: CellSet = [13_u64].into_iter().collect();
        assert_eq!(a.len(), 2);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.sql_ids(), vec![10, 11]);
    }
}
