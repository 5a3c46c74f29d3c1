// crates/scd-core/src/runtime/context.rs
// ============================================================================
// Module: SCD Request Context
// Description: Caller-owned cancellation and deadline for store calls.
// Purpose: Stop issuing backend statements once the caller has given up.
// Dependencies: crate::interfaces
// ============================================================================

//! ## Overview
//! The store has no threads of its own; it runs on the caller's thread. A
//! [`RequestContext`] carries the caller's cancellation flag and deadline and
//! is checked before every backend statement. Backends also receive the
//! context: they cap lock waits and statement timeouts at [`RequestContext::budget`]
//! and interrupt running statements once it is cancelled. A cancelled write
//! returns an error from inside the unit of work, so the backend rolls it back.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::interfaces::ScdError;

// ============================================================================
// SECTION: Context
// ============================================================================

/// Cancellation scope for one store call.
///
/// Clones share the same cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Shared cancellation flag.
    cancelled: Arc<AtomicBool>,
    /// Optional deadline after which work stops.
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Creates a context with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Cancels the context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the time left before the deadline, if one is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Caps `limit` at the time left before the deadline.
    ///
    /// The remaining time is rounded up to the next whole millisecond, so a
    /// wait bounded by the budget always ends past the deadline.
    #[must_use]
    pub fn budget(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => {
                let millis = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
                limit.min(Duration::from_millis(millis.saturating_add(1)))
            }
            None => limit,
        }
    }

    /// Reports a store failure as [`ScdError::Cancelled`] when the context
    /// stopped while the failing statement ran.
    ///
    /// Interrupted statements and expired lock waits surface from backends as
    /// store errors; other errors pass through unchanged.
    #[must_use]
    pub fn attribute(&self, error: ScdError) -> ScdError {
        if matches!(error, ScdError::Store { .. })
            && let Err(cancelled) = self.ensure_active()
        {
            return cancelled;
        }
        error
    }

    /// Fails when the context is cancelled or past its deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ScdError::Cancelled`] when work must stop.
    pub fn ensure_active(&self) -> Result<(), ScdError> {
        if self.is_cancelled() {
            return Err(ScdError::Cancelled("request cancelled".to_string()));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ScdError::Cancelled("request deadline exceeded".to_string()));
        }
        Ok(())
    }
}
