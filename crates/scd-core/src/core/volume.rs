// crates/scd-core/src/core/volume.rs
// ============================================================================
// Module: SCD Volumes
// Description: 3D/4D query volumes and the footprint covering contract.
// Purpose: Describe spatial/temporal search regions and resolve them to cells.
// Dependencies: thiserror, time
// ============================================================================

//! ## Overview
//! Search regions are expressed as a [`Volume4D`]: an optional time window
//! around an optional [`Volume3D`] (altitude band plus a footprint). The
//! footprint is a black-box geometry service that yields a cell covering.
//! Backends never see footprints; they execute a resolved [`CellQuery`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;

use crate::core::cells::CellSet;
use crate::core::cells::MAX_COVERING_CELLS;
use crate::core::operation::Operation;

// ============================================================================
// SECTION: Footprint
// ============================================================================

/// Geometry covering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    /// The volume carries no footprint.
    #[error("missing geospatial footprint for query")]
    MissingFootprint,
    /// The footprint covers no cells.
    #[error("missing cell ids for query")]
    EmptyCovering,
    /// The covering has more cells than a single query may bind.
    #[error("covering has {count} cells, limit is {MAX_COVERING_CELLS}")]
    TooManyCells {
        /// Number of cells in the covering.
        count: usize,
    },
    /// The geometry service rejected the footprint.
    #[error("failed to calculate footprint covering: {0}")]
    Covering(String),
}

/// Geometry that can be approximated by a set of cells.
pub trait Footprint: fmt::Debug + Send + Sync {
    /// Computes the cell covering of this footprint.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError`] when the footprint is degenerate.
    fn calculate_covering(&self) -> Result<CellSet, GeometryError>;
}

impl Footprint for CellSet {
    fn calculate_covering(&self) -> Result<CellSet, GeometryError> {
        Ok(self.clone())
    }
}

// ============================================================================
// SECTION: Volumes
// ============================================================================

/// Altitude band over a footprint.
#[derive(Debug, Clone, Default)]
pub struct Volume3D {
    /// Lower altitude bound (`None` = unbounded).
    pub altitude_lo: Option<f64>,
    /// Upper altitude bound (`None` = unbounded).
    pub altitude_hi: Option<f64>,
    /// Horizontal footprint.
    pub footprint: Option<Arc<dyn Footprint>>,
}

/// Time window around a 3D volume.
#[derive(Debug, Clone, Default)]
pub struct Volume4D {
    /// Start of the window (`None` = unbounded).
    pub start_time: Option<OffsetDateTime>,
    /// End of the window (`None` = unbounded).
    pub end_time: Option<OffsetDateTime>,
    /// Spatial part of the volume.
    pub spatial_volume: Option<Volume3D>,
}

impl Volume4D {
    /// Resolves the footprint into the cell query executed by backends.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError`] when the footprint is absent, fails to
    /// cover, covers nothing, or covers more than [`MAX_COVERING_CELLS`].
    pub fn resolve(&self) -> Result<CellQuery, GeometryError> {
        let Some(spatial) = &self.spatial_volume else {
            return Err(GeometryError::MissingFootprint);
        };
        let Some(footprint) = &spatial.footprint else {
            return Err(GeometryError::MissingFootprint);
        };
        let cells = footprint.calculate_covering()?;
        if cells.is_empty() {
            return Err(GeometryError::EmptyCovering);
        }
        if cells.len() > MAX_COVERING_CELLS {
            return Err(GeometryError::TooManyCells {
                count: cells.len(),
            });
        }
        Ok(CellQuery {
            cells,
            altitude_lo: spatial.altitude_lo,
            altitude_hi: spatial.altitude_hi,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

// ============================================================================
// SECTION: Cell Query
// ============================================================================

/// Resolved search: a non-empty covering plus optional bounds.
///
/// # Invariants
/// - `cells` is never empty.
/// - An unset bound on either the query or the row matches everything.
#[derive(Debug, Clone, PartialEq)]
pub struct CellQuery {
    /// Covering to intersect with the Cell Index.
    pub cells: CellSet,
    /// Lower altitude bound.
    pub altitude_lo: Option<f64>,
    /// Upper altitude bound.
    pub altitude_hi: Option<f64>,
    /// Start of the time window.
    pub start_time: Option<OffsetDateTime>,
    /// End of the time window.
    pub end_time: Option<OffsetDateTime>,
}

impl CellQuery {
    /// Applies the altitude and time filters to an Operation row.
    ///
    /// Mirrors the SQL `COALESCE(row_bound <op> query_bound, true)` filters.
    #[must_use]
    pub fn bounds_match(&self, operation: &Operation) -> bool {
        overlap(operation.altitude_upper, self.altitude_lo, |upper, lo| upper >= lo)
            && overlap(operation.altitude_lower, self.altitude_hi, |lower, hi| lower <= hi)
            && overlap(operation.end_time, self.start_time, |ends, start| ends >= start)
            && overlap(operation.start_time, self.end_time, |starts, end| starts <= end)
    }
}

/// Evaluates a bound comparison where a missing side means "unbounded".
fn overlap<T>(row: Option<T>, query: Option<T>, cmp: impl Fn(T, T) -> bool) -> bool {
    match (row, query) {
        (Some(row), Some(query)) => cmp(row, query),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test fixtures use explicit asserts and unwraps for clarity."
    )]

    use std::sync::Arc;

    use super::GeometryError;
    use super::Volume3D;
    use super::Volume4D;
    use crate::core::cells::CellSet;
    use crate::core::cells::MAX_COVERING_CELLS;

    #[test]
    fn resolve_requires_footprint() {
        let volume = Volume4D::default();
        assert_eq!(volume.resolve().unwrap_err(), GeometryError::MissingFootprint);
        let volume = Volume4D {
            spatial_volume: Some(Volume3D::default()),
            ..Volume4D::default()
        };
        assert_eq!(volume.resolve().unwrap_err(), GeometryError::MissingFootprint);
    }

    #[test]
    fn resolve_rejects_empty_covering() {
        let volume = Volume4D {
            spatial_volume: Some(Volume3D {
                footprint: Some(Arc::new(CellSet::new())),
                ..Volume3D::default()
            }),
            ..Volume4D::default()
        };
        assert_eq!(volume.resolve().unwrap_err(), GeometryError::EmptyCovering);
    }

    #[test]
    fn resolve_rejects_oversized_covering() {
        let volume = |count: usize| Volume4D {
            spatial_volume: Some(Volume3D {
                footprint: Some(Arc::new(
                    (1..=u64::try_from(count).unwrap()).collect::<CellSet>(),
                )),
                ..Volume3D::default()
            }),
            ..Volume4D::default()
        };
        assert!(volume(MAX_COVERING_CELLS).resolve().is_ok());
        assert_eq!(
            volume(MAX_COVERING_CELLS + 1).resolve().unwrap_err(),
            GeometryError::TooManyCells {
                count: MAX_COVERING_CELLS + 1
            }
        );
    }
}
