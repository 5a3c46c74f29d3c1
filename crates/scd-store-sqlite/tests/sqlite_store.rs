// crates/scd-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Operation Store Tests
// Description: Behavioral and integrity tests for the SQLite backend.
// Purpose: Validate persistence, Cell Index rows, cascades, schema versioning,
//          and write serialization across connections.
// ============================================================================

//! ## Overview
//! Integration tests for [`SqliteOperationBackend`]:
//! - The two-operator conflict scenario against a real database
//! - Cell Index rows (signed cell ids and levels) after create/update/delete
//! - Implicit-subscription cascade and notification index bumps
//! - Rollback of rejected writes and of writes failing after the row write
//! - Request deadlines bounding the wait for the write lock
//! - Coverings at the size limit
//! - Reopen persistence and schema version validation
//! - Concurrent creates from two connections

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use rusqlite::Connection;
use rusqlite::params;
use scd_core::CellId;
use scd_core::CellSet;
use scd_core::MAX_COVERING_CELLS;
use scd_core::Operation;
use scd_core::OperationId;
use scd_core::OperationState;
use scd_core::OperationStore;
use scd_core::Ovn;
use scd_core::Owner;
use scd_core::RequestContext;
use scd_core::ScdError;
use scd_core::Subscription;
use scd_core::SubscriptionId;
use scd_core::SubscriptionRegistration;
use scd_core::Version;
use scd_core::Volume3D;
use scd_core::Volume4D;
use scd_store_sqlite::SqliteOperationBackend;
use scd_store_sqlite::SqliteOperationStore;
use scd_store_sqlite::SqliteStoreConfig;
use scd_store_sqlite::SqliteStoreError;
use scd_store_sqlite::SqliteStoreMode;
use scd_store_sqlite::SqliteSyncMode;
use tempfile::TempDir;
use time::Duration;
use time::OffsetDateTime;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Level-0 face cell whose raw id does not fit in `i64`.
const HIGH_FACE_CELL: u64 = 0xB000_0000_0000_0000;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("scd.sqlite")
}

fn open_backend(path: &Path) -> SqliteOperationBackend {
    let config = SqliteStoreConfig {
        path: path.to_path_buf(),
        busy_timeout_ms: 5_000,
        journal_mode: SqliteStoreMode::Wal,
        sync_mode: SqliteSyncMode::Normal,
    };
    SqliteOperationBackend::new(&config).expect("open sqlite backend")
}

fn open_store(path: &Path) -> SqliteOperationStore {
    OperationStore::new(open_backend(path))
}

fn t0() -> OffsetDateTime {
    OffsetDateTime::now_utc().replace_nanosecond(0).unwrap()
}

fn cells(ids: &[u64]) -> CellSet {
    ids.iter().copied().collect()
}

fn operation(id: &str, owner: &str, cell_ids: &[u64], start: OffsetDateTime) -> Operation {
    Operation {
        id: OperationId::new(id),
        owner: Owner::new(owner),
        version: Version::EMPTY,
        ovn: None,
        uss_base_url: format!("https://{owner}.example/uss"),
        altitude_lower: Some(0.0),
        altitude_upper: Some(100.0),
        start_time: Some(start),
        end_time: Some(start + Duration::hours(1)),
        subscription_id: None,
        state: OperationState::Accepted,
        cells: cells(cell_ids),
        updated_at: None,
    }
}

fn subscription(id: &str, owner: &str, implicit: bool, cell_ids: &[u64]) -> SubscriptionRegistration {
    SubscriptionRegistration {
        subscription: Subscription {
            id: SubscriptionId::new(id),
            owner: Owner::new(owner),
            uss_base_url: format!("https://{owner}.example/uss"),
            notification_index: 0,
            implicit,
            start_time: None,
            end_time: None,
        },
        cells: cells(cell_ids),
    }
}

fn ovn_of(op: &Operation) -> Ovn {
    op.ovn.clone().expect("stored operations carry an ovn")
}

fn indexed_cells(path: &Path, id: &str) -> Vec<(i64, i64)> {
    let conn = Connection::open(path).unwrap();
    let mut statement = conn
        .prepare(
            "SELECT cell_id, cell_level FROM scd_cells_operations WHERE operation_id = ?1 \
             ORDER BY cell_id",
        )
        .unwrap();
    statement
        .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn count_rows(path: &Path, sql: &str, id: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(sql, params![id], |row| row.get(0)).unwrap()
}

// ============================================================================
// SECTION: Scenario
// ============================================================================

#[test]
fn two_operator_conflict_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&db_path(&dir));
    let ctx = RequestContext::new();
    let start = t0();

    let op1 = store.upsert(&ctx, operation("op1", "alice", &[1, 2], start), &[]).unwrap();
    assert_eq!(op1.operation.version, Version::new(1));

    let mut op2 = operation("op2", "bob", &[2, 3], start);
    op2.state = OperationState::Activated;
    let err = store.upsert(&ctx, op2.clone(), &[]).unwrap_err();
    match err {
        ScdError::MissingOvns {
            missing,
        } => assert_eq!(missing, vec![OperationId::new("op1")]),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(store.get(&ctx, &OperationId::new("op2")), Err(ScdError::NotFound(_))));

    let op2 = store.upsert(&ctx, op2, &[ovn_of(&op1.operation)]).unwrap();
    assert_eq!(op2.operation.version, Version::new(1));

    let mut update = operation("op1", "alice", &[1, 2], start);
    update.version = Version::new(1);
    update.state = OperationState::Activated;
    let err = store.upsert(&ctx, update.clone(), &[]).unwrap_err();
    assert!(matches!(err, ScdError::MissingOvns { .. }));

    let updated = store.upsert(&ctx, update, &[ovn_of(&op2.operation)]).unwrap();
    assert_eq!(updated.operation.version, Version::new(2));
    assert_ne!(updated.operation.ovn, op1.operation.ovn);

    let mut stale = operation("op1", "alice", &[1, 2], start);
    stale.version = Version::new(1);
    assert!(matches!(store.upsert(&ctx, stale, &[]), Err(ScdError::VersionMismatch(_))));

    let fetched = store.get(&ctx, &OperationId::new("op1")).unwrap();
    assert_eq!(fetched.version, Version::new(2));
    assert_eq!(fetched.ovn, updated.operation.ovn);
    assert_eq!(fetched.state, OperationState::Activated);
}

// ============================================================================
// SECTION: Cell Index
// ============================================================================

#[test]
fn cell_rows_store_signed_ids_and_levels() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();

    store.upsert(&ctx, operation("op1", "alice", &[1, 1 << 60, HIGH_FACE_CELL], t0()), &[]).unwrap();

    let rows = indexed_cells(&path, "op1");
    let high = CellId::new(HIGH_FACE_CELL);
    assert_eq!(rows, vec![(high.to_sql(), 0), (1, 30), (1 << 60, 0)]);
    assert!(high.to_sql() < 0);
    assert_eq!(
        store.cells_of(&ctx, &OperationId::new("op1")).unwrap(),
        cells(&[1, 1 << 60, HIGH_FACE_CELL])
    );
}

#[test]
fn update_replaces_cell_rows_exactly() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();
    let start = t0();

    store.upsert(&ctx, operation("op1", "alice", &[1, 2, 3], start), &[]).unwrap();
    let mut update = operation("op1", "alice", &[3, 4], start);
    update.version = Version::new(1);
    store.upsert(&ctx, update, &[]).unwrap();

    assert_eq!(store.cells_of(&ctx, &OperationId::new("op1")).unwrap(), cells(&[3, 4]));
    let ids: Vec<i64> = indexed_cells(&path, "op1").into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![3, 4]);
    assert!(store.operations_intersecting(&ctx, &cells(&[1, 2])).unwrap().is_empty());
}

#[test]
fn search_deduplicates_and_applies_bounds() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&db_path(&dir));
    let ctx = RequestContext::new();
    let start = t0();

    store.upsert(&ctx, operation("op1", "alice", &[1, 2, 3], start), &[]).unwrap();
    let mut high = operation("op2", "bob", &[2], start);
    high.altitude_lower = Some(500.0);
    high.altitude_upper = Some(600.0);
    store.upsert(&ctx, high, &[]).unwrap();
    let mut unbounded = operation("op3", "carol", &[3], start);
    unbounded.altitude_lower = None;
    unbounded.altitude_upper = None;
    store.upsert(&ctx, unbounded, &[]).unwrap();

    let volume = Volume4D {
        start_time: Some(start),
        end_time: Some(start + Duration::minutes(30)),
        spatial_volume: Some(Volume3D {
            altitude_lo: Some(0.0),
            altitude_hi: Some(50.0),
            footprint: Some(Arc::new(cells(&[1, 2, 3]))),
        }),
    };
    let found = store.search(&ctx, &volume).unwrap();
    let ids: Vec<&str> = found.iter().map(|op| op.id.as_str()).collect();
    assert_eq!(ids, vec!["op1", "op3"]);
    assert!(found.iter().all(|op| op.cells.is_empty() && op.ovn.is_some()));

    let later = Volume4D {
        start_time: Some(start + Duration::hours(2)),
        end_time: Some(start + Duration::hours(3)),
        ..volume
    };
    assert!(store.search(&ctx, &later).unwrap().is_empty());
}

#[test]
fn covering_at_size_limit_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();
    let limit = u64::try_from(MAX_COVERING_CELLS).unwrap();
    let covering: CellSet = (1..=limit).collect();

    let op1 = operation("op1", "alice", &[], t0());
    let op1 = Operation {
        cells: covering.clone(),
        ..op1
    };
    let stored = store.upsert(&ctx, op1.clone(), &[]).unwrap().operation;
    assert_eq!(store.cells_of(&ctx, &op1.id).unwrap().len(), MAX_COVERING_CELLS);

    let found = store
        .search(
            &ctx,
            &Volume4D {
                spatial_volume: Some(Volume3D {
                    footprint: Some(Arc::new(covering)),
                    ..Volume3D::default()
                }),
                ..Volume4D::default()
            },
        )
        .unwrap();
    assert_eq!(found.len(), 1);

    let shrunk = Operation {
        version: stored.version,
        cells: (2..=limit).collect(),
        ..op1
    };
    store.upsert(&ctx, shrunk, &[]).unwrap();
    assert_eq!(indexed_cells(&path, "op1").len(), MAX_COVERING_CELLS - 1);
}

// ============================================================================
// SECTION: Subscriptions
// ============================================================================

#[test]
fn upsert_bumps_intersecting_subscriptions() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&db_path(&dir));
    let ctx = RequestContext::new();

    store.register_subscription(&ctx, &subscription("sub-b", "bob", false, &[2, 9])).unwrap();
    store.register_subscription(&ctx, &subscription("sub-a", "carol", false, &[1])).unwrap();
    store.register_subscription(&ctx, &subscription("sub-z", "dave", false, &[42])).unwrap();

    let outcome = store.upsert(&ctx, operation("op1", "alice", &[1, 2], t0()), &[]).unwrap();
    let notified: Vec<(&str, i64)> = outcome
        .subscribers
        .iter()
        .map(|sub| (sub.id.as_str(), sub.notification_index))
        .collect();
    assert_eq!(notified, vec![("sub-a", 1), ("sub-b", 1)]);

    let untouched = store.subscription(&ctx, &SubscriptionId::new("sub-z")).unwrap().unwrap();
    assert_eq!(untouched.notification_index, 0);
}

#[test]
fn delete_cascades_cells_and_implicit_subscription() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();
    let start = t0();

    store.register_subscription(&ctx, &subscription("sub-1", "alice", true, &[1, 2])).unwrap();
    let mut op1 = operation("op1", "alice", &[1, 2], start);
    op1.subscription_id = Some(SubscriptionId::new("sub-1"));
    store.upsert(&ctx, op1.clone(), &[]).unwrap();
    let mut op2 = op1;
    op2.id = OperationId::new("op2");
    store.upsert(&ctx, op2, &[]).unwrap();

    let first = store.delete(&ctx, &OperationId::new("op1"), &Owner::new("alice")).unwrap();
    assert_eq!(first.removed_subscription, None);
    assert_eq!(first.operation.cells, cells(&[1, 2]));
    assert_eq!(
        count_rows(&path, "SELECT COUNT(*) FROM scd_cells_operations WHERE operation_id = ?1", "op1"),
        0
    );

    let second = store.delete(&ctx, &OperationId::new("op2"), &Owner::new("alice")).unwrap();
    assert_eq!(second.removed_subscription, Some(SubscriptionId::new("sub-1")));
    assert!(store.subscription(&ctx, &SubscriptionId::new("sub-1")).unwrap().is_none());
    assert_eq!(
        count_rows(
            &path,
            "SELECT COUNT(*) FROM scd_cells_subscriptions WHERE subscription_id = ?1",
            "sub-1"
        ),
        0
    );
}

#[test]
fn foreign_owner_delete_leaves_rows_in_place() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();

    store.upsert(&ctx, operation("op1", "alice", &[1], t0()), &[]).unwrap();
    let err = store.delete(&ctx, &OperationId::new("op1"), &Owner::new("mallory")).unwrap_err();
    assert!(matches!(err, ScdError::PermissionDenied(_)));
    assert_eq!(indexed_cells(&path, "op1").len(), 1);
    assert!(store.get(&ctx, &OperationId::new("op1")).is_ok());
}

// ============================================================================
// SECTION: Transactions
// ============================================================================

#[test]
fn rejected_write_rolls_back_every_statement() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&db_path(&dir));
    let ctx = RequestContext::new();
    let start = t0();

    store.register_subscription(&ctx, &subscription("sub-1", "carol", false, &[2])).unwrap();
    store.upsert(&ctx, operation("op1", "alice", &[2], start), &[]).unwrap();

    let mut op2 = operation("op2", "bob", &[2], start);
    op2.state = OperationState::Activated;
    assert!(store.upsert(&ctx, op2, &[]).is_err());

    let sub = store.subscription(&ctx, &SubscriptionId::new("sub-1")).unwrap().unwrap();
    assert_eq!(sub.notification_index, 1);
    assert!(store.cells_of(&ctx, &OperationId::new("op2")).unwrap().is_empty());
}

#[test]
fn cancelled_context_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&db_path(&dir));
    let ctx = RequestContext::new();
    ctx.cancel();

    let err = store.upsert(&ctx, operation("op1", "alice", &[1], t0()), &[]).unwrap_err();
    assert!(matches!(err, ScdError::Cancelled(_)));
    let fresh = RequestContext::new();
    assert!(matches!(store.get(&fresh, &OperationId::new("op1")), Err(ScdError::NotFound(_))));
}

#[test]
fn failure_after_row_write_commits_nothing() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();
    let start = t0();

    store.register_subscription(&ctx, &subscription("sub-1", "carol", false, &[2, 3])).unwrap();
    let op1 = store.upsert(&ctx, operation("op1", "alice", &[2], start), &[]).unwrap().operation;

    let admin = Connection::open(&path).unwrap();
    admin
        .execute_batch(
            "CREATE TRIGGER fail_notification BEFORE UPDATE ON scd_subscriptions
             BEGIN SELECT RAISE(ABORT, 'notification store offline'); END;",
        )
        .unwrap();

    let mut update = operation("op1", "alice", &[3], start);
    update.version = op1.version;
    let err = store.upsert(&ctx, update, &[]).unwrap_err();
    assert!(matches!(err, ScdError::Store { .. }), "got {err}");
    let err = store.upsert(&ctx, operation("op2", "bob", &[3], start), &[]).unwrap_err();
    assert!(matches!(err, ScdError::Store { .. }), "got {err}");

    let stored = store.get(&ctx, &OperationId::new("op1")).unwrap();
    assert_eq!(stored.version, Version::new(1));
    assert_eq!(stored.ovn, op1.ovn);
    assert_eq!(store.cells_of(&ctx, &OperationId::new("op1")).unwrap(), cells(&[2]));
    assert!(matches!(store.get(&ctx, &OperationId::new("op2")), Err(ScdError::NotFound(_))));
    assert!(indexed_cells(&path, "op2").is_empty());
    let sub = store.subscription(&ctx, &SubscriptionId::new("sub-1")).unwrap().unwrap();
    assert_eq!(sub.notification_index, 1);
}

#[test]
fn deadline_bounds_wait_for_write_lock() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let blocker = Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let ctx = RequestContext::with_timeout(std::time::Duration::from_millis(100));
    let started = Instant::now();
    let err = store.upsert(&ctx, operation("op1", "alice", &[1], t0()), &[]).unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, ScdError::Cancelled(_)), "got {err}");
    assert!(elapsed < std::time::Duration::from_secs(2), "waited {elapsed:?}");

    blocker.execute_batch("ROLLBACK;").unwrap();
    let ctx = RequestContext::new();
    store.upsert(&ctx, operation("op1", "alice", &[1], t0()), &[]).unwrap();
    assert_eq!(store.get(&ctx, &OperationId::new("op1")).unwrap().version, Version::new(1));
}

#[test]
fn concurrent_creates_admit_exactly_one_writer() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let stores = [open_store(&path), open_store(&path)];
    let barrier = Barrier::new(stores.len());
    let start = t0();

    let results: Vec<Result<_, ScdError>> = thread::scope(|scope| {
        let handles: Vec<_> = stores
            .iter()
            .map(|store| {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    store.upsert(&RequestContext::new(), operation("op1", "alice", &[1], start), &[])
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let created = results.iter().filter(|result| result.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|result| matches!(result, Err(ScdError::AlreadyExists(_))))
        .count();
    assert_eq!((created, rejected), (1, 1));
}

// ============================================================================
// SECTION: Integrity
// ============================================================================

#[test]
fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let ctx = RequestContext::new();
    let stored = {
        let store = open_store(&path);
        store.upsert(&ctx, operation("op1", "alice", &[1, 2], t0()), &[]).unwrap().operation
    };

    let reopened = open_store(&path);
    let fetched = reopened.get(&ctx, &OperationId::new("op1")).unwrap();
    assert_eq!(fetched.version, stored.version);
    assert_eq!(fetched.ovn, stored.ovn);
    assert_eq!(fetched.start_time, stored.start_time);
    assert_eq!(reopened.cells_of(&ctx, &OperationId::new("op1")).unwrap(), cells(&[1, 2]));
}

#[test]
fn unsupported_schema_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    drop(open_backend(&path));
    let conn = Connection::open(&path).unwrap();
    conn.execute("UPDATE store_meta SET version = ?1", params![99]).unwrap();
    drop(conn);

    let config = SqliteStoreConfig::new(&path);
    let err = SqliteOperationBackend::new(&config).unwrap_err();
    assert!(matches!(err, SqliteStoreError::VersionMismatch(_)));
}

#[test]
fn directory_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = SqliteStoreConfig::new(dir.path());
    let err = SqliteOperationBackend::new(&config).unwrap_err();
    assert!(matches!(err, SqliteStoreError::Invalid(_)));
}

#[test]
fn unknown_state_label_is_reported_as_corruption() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = open_store(&path);
    let ctx = RequestContext::new();
    store.upsert(&ctx, operation("op1", "alice", &[1], t0()), &[]).unwrap();

    let conn = Connection::open(&path).unwrap();
    conn.execute("UPDATE scd_operations SET state = 'Bogus' WHERE id = ?1", params!["op1"]).unwrap();
    drop(conn);

    let err = store.get(&ctx, &OperationId::new("op1")).unwrap_err();
    assert!(matches!(
        err,
        ScdError::Store {
            source: scd_core::StoreError::Corrupt(_),
            ..
        }
    ));
}
