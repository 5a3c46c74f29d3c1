// crates/scd-core/src/core/version.rs
// ============================================================================
// Module: SCD Record Version
// Description: Strictly increasing per-record write counter.
// Purpose: Carry the optimistic-concurrency version between callers and the store.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every successful mutating write sets the stored version to the previous
//! value plus one (`COALESCE(old, 0) + 1`). Callers treat the value as opaque
//! beyond emptiness and equality: an empty version requests a create, a
//! non-empty one requests an update of exactly that version.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Version
// ============================================================================

/// Record version counter.
///
/// # Invariants
/// - `0` is the empty version and is never stored.
/// - Stored versions start at `1` and grow by exactly `1` per write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// The empty version supplied by callers creating a new record.
    pub const EMPTY: Self = Self(0);

    /// Creates a version from its stored value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the stored value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Returns `true` for the empty (create) version.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when the caller-supplied version matches the stored one.
    #[must_use]
    pub const fn matches(self, stored: Self) -> bool {
        self.0 == stored.0
    }

    /// Returns the version assigned by the next successful write.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
