// crates/scd-core/src/core/ovn.rs
// ============================================================================
// Module: SCD Operation Version Number
// Description: Opaque version token derived from last-write time and identity.
// Purpose: Let operators prove which state of an Operation they have observed.
// Dependencies: sha2, base64, time
// ============================================================================

//! ## Overview
//! An OVN is `base64url(sha256("{id}:{unix_nanos}"))` over the record's
//! last-modified timestamp. It is never persisted: every read recomputes it
//! from the stored timestamp, so it changes whenever the row is rewritten.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::core::identifiers::OperationId;

// ============================================================================
// SECTION: OVN
// ============================================================================

/// Operation version number presented to other operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ovn(String);

impl Ovn {
    /// Wraps an OVN received from a caller.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives the OVN for a record last written at `updated_at`.
    #[must_use]
    pub fn from_time(updated_at: OffsetDateTime, id: &OperationId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(updated_at.unix_timestamp_nanos().to_string().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ovn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Ovn {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
