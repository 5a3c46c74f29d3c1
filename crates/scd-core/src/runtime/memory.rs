// crates/scd-core/src/runtime/memory.rs
// ============================================================================
// Module: SCD In-Memory Backend
// Description: Simple in-memory Operation backend for tests and examples.
// Purpose: Provide a transactional backend without external dependencies.
// Dependencies: crate::{core, interfaces, runtime::context}
// ============================================================================

//! ## Overview
//! This module provides an in-memory [`OperationBackend`] for tests and local
//! demos. Writes run against a private copy of the tables that replaces the
//! shared copy only when the unit of work succeeds, which gives the same
//! all-or-nothing behavior as a database transaction. It is not intended for
//! production use.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

use time::OffsetDateTime;

use crate::core::CellQuery;
use crate::core::CellSet;
use crate::core::Operation;
use crate::core::OperationId;
use crate::core::Ovn;
use crate::core::Owner;
use crate::core::Subscription;
use crate::core::SubscriptionId;
use crate::core::SubscriptionRegistration;
use crate::interfaces::OperationBackend;
use crate::interfaces::OperationSession;
use crate::interfaces::ScdError;
use crate::interfaces::StoreError;
use crate::interfaces::StoreResultExt;
use crate::runtime::context::RequestContext;

// ============================================================================
// SECTION: Tables
// ============================================================================

/// In-memory tables mirroring the persisted layout.
#[derive(Debug, Clone, Default)]
struct Tables {
    /// Operation rows keyed by id (no OVN, no cells).
    operations: BTreeMap<OperationId, Operation>,
    /// Cell Index rows keyed by Operation id.
    operation_cells: BTreeMap<OperationId, CellSet>,
    /// Subscription rows keyed by id.
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    /// Subscription cell rows keyed by Subscription id.
    subscription_cells: BTreeMap<SubscriptionId, CellSet>,
}

/// In-memory Operation backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    /// Committed tables protected by a mutex.
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationBackend for InMemoryBackend {
    fn read<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        ctx.ensure_active()?;
        let snapshot = self
            .tables
            .lock()
            .map_err(|_| StoreError::Db("mutex poisoned".to_string()))
            .context("error opening read session")?
            .clone();
        let mut session = MemorySession {
            tables: snapshot,
        };
        work(&mut session)
    }

    fn write<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T, ScdError>
    where
        F: FnOnce(&mut dyn OperationSession) -> Result<T, ScdError>,
    {
        ctx.ensure_active()?;
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| StoreError::Db("mutex poisoned".to_string()))
            .context("error beginning transaction")?;
        ctx.ensure_active()?;
        let mut session = MemorySession {
            tables: guard.clone(),
        };
        let value = work(&mut session)?;
        *guard = session.tables;
        drop(guard);
        Ok(value)
    }
}

// ============================================================================
// SECTION: Session
// ============================================================================

/// Private working copy of the tables for one unit of work.
struct MemorySession {
    /// Working tables.
    tables: Tables,
}

impl MemorySession {
    /// Maps a stored row to the read model, deriving its OVN.
    fn row(operation: &Operation) -> Operation {
        let mut operation = operation.clone();
        operation.ovn = operation.updated_at.map(|updated_at| Ovn::from_time(updated_at, &operation.id));
        operation
    }
}

impl OperationSession for MemorySession {
    fn fetch_operation(&mut self, id: &OperationId) -> Result<Option<Operation>, StoreError> {
        Ok(self.tables.operations.get(id).map(Self::row))
    }

    fn operations_intersecting(
        &mut self,
        cells: &CellSet,
    ) -> Result<BTreeSet<OperationId>, StoreError> {
        Ok(self
            .tables
            .operation_cells
            .iter()
            .filter(|(_, indexed)| indexed.intersects(cells))
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn search_operations(&mut self, query: &CellQuery) -> Result<Vec<Operation>, StoreError> {
        let ids = self.operations_intersecting(&query.cells)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.tables.operations.get(id))
            .filter(|operation| query.bounds_match(operation))
            .map(Self::row)
            .collect())
    }

    fn write_operation(
        &mut self,
        operation: &Operation,
        updated_at: OffsetDateTime,
    ) -> Result<Operation, StoreError> {
        let version = self
            .tables
            .operations
            .get(&operation.id)
            .map(|old| old.version)
            .unwrap_or_default()
            .next();
        let row = Operation {
            version,
            ovn: None,
            cells: CellSet::new(),
            updated_at: Some(updated_at),
            ..operation.clone()
        };
        let stored = Self::row(&row);
        self.tables.operations.insert(operation.id.clone(), row);
        Ok(stored)
    }

    fn replace_cells(&mut self, id: &OperationId, cells: &CellSet) -> Result<(), StoreError> {
        if cells.is_empty() {
            self.tables.operation_cells.remove(id);
        } else {
            self.tables.operation_cells.insert(id.clone(), cells.clone());
        }
        Ok(())
    }

    fn cells_of(&mut self, id: &OperationId) -> Result<CellSet, StoreError> {
        Ok(self.tables.operation_cells.get(id).cloned().unwrap_or_default())
    }

    fn subscriptions_for_notification(
        &mut self,
        cells: &CellSet,
    ) -> Result<Vec<Subscription>, StoreError> {
        let Tables {
            subscriptions,
            subscription_cells,
            ..
        } = &mut self.tables;
        let mut selected = Vec::new();
        for (id, subscription) in subscriptions.iter_mut() {
            if subscription_cells.get(id).is_some_and(|indexed| indexed.intersects(cells)) {
                subscription.notification_index = subscription.notification_index.saturating_add(1);
                selected.push(subscription.clone());
            }
        }
        Ok(selected)
    }

    fn delete_operation(&mut self, id: &OperationId, owner: &Owner) -> Result<(), StoreError> {
        if self.tables.operations.get(id).is_some_and(|row| row.owner == *owner) {
            self.tables.operations.remove(id);
            self.tables.operation_cells.remove(id);
        }
        Ok(())
    }

    fn delete_implicit_subscription(
        &mut self,
        id: &SubscriptionId,
        owner: &Owner,
    ) -> Result<bool, StoreError> {
        let referenced = self
            .tables
            .operations
            .values()
            .any(|operation| operation.subscription_id.as_ref() == Some(id));
        let removable = self
            .tables
            .subscriptions
            .get(id)
            .is_some_and(|subscription| subscription.implicit && subscription.owner == *owner);
        if !removable || referenced {
            return Ok(false);
        }
        self.tables.subscriptions.remove(id);
        self.tables.subscription_cells.remove(id);
        Ok(true)
    }

    fn fetch_subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.tables.subscriptions.get(id).cloned())
    }

    fn register_subscription(
        &mut self,
        registration: &SubscriptionRegistration,
    ) -> Result<(), StoreError> {
        let id = registration.subscription.id.clone();
        self.tables.subscriptions.insert(id.clone(), registration.subscription.clone());
        self.tables.subscription_cells.insert(id, registration.cells.clone());
        Ok(())
    }
}
