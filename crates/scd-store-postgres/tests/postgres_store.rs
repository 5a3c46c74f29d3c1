// crates/scd-store-postgres/tests/postgres_store.rs
// ============================================================================
// Module: Postgres Store Tests
// Description: Tests for Postgres store configuration and error mapping.
// Purpose: Validate configuration handling without a live database.
// ============================================================================

//! Postgres store tests that run without a database.

use scd_core::StoreError;
use scd_store_postgres::PostgresOperationBackend;
use scd_store_postgres::PostgresStoreConfig;
use scd_store_postgres::PostgresStoreError;

#[test]
fn postgres_store_default_config_is_valid_shape() {
    let config = PostgresStoreConfig::default();
    assert!(config.connection.starts_with("postgres://"));
    assert!(config.max_connections > 0);
    assert!(config.connect_timeout_ms > 0);
    assert!(config.statement_timeout_ms > 0);
}

#[test]
fn postgres_store_invalid_connection_string_fails() {
    let config = PostgresStoreConfig {
        connection: "not-a-url".to_string(),
        max_connections: 1,
        connect_timeout_ms: 1,
        statement_timeout_ms: 1,
    };
    let result = PostgresOperationBackend::new(&config);
    assert!(matches!(result, Err(PostgresStoreError::Invalid(_))));
}

#[test]
fn postgres_store_errors_map_onto_store_errors() {
    assert!(matches!(
        StoreError::from(PostgresStoreError::Io("refused".to_string())),
        StoreError::Io(_)
    ));
    assert!(matches!(
        StoreError::from(PostgresStoreError::Postgres("syntax".to_string())),
        StoreError::Db(_)
    ));
    assert!(matches!(
        StoreError::from(PostgresStoreError::Corrupt("dup".to_string())),
        StoreError::Corrupt(_)
    ));
    assert!(matches!(
        StoreError::from(PostgresStoreError::VersionMismatch("2".to_string())),
        StoreError::VersionMismatch(_)
    ));
}
