//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: record store, operation log and sync cursors
fn migrate_v1(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS records (
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_by TEXT NOT NULL,
            payload TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            conflict_resolved INTEGER NOT NULL DEFAULT 1,
            dirty INTEGER NOT NULL DEFAULT 0,
            tombstoned_at INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, entity_type, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(tenant_id, dirty);
        CREATE INDEX IF NOT EXISTS idx_records_tombstones
            ON records(tenant_id, deleted, tombstoned_at);

        CREATE TABLE IF NOT EXISTS operations (
            operation_id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL,
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload_delta TEXT NOT NULL,
            base_version INTEGER NOT NULL,
            base_snapshot TEXT NOT NULL,
            updated_by TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_operations_queue ON operations(tenant_id, status, seq);
        CREATE INDEX IF NOT EXISTS idx_operations_entity
            ON operations(tenant_id, entity_type, entity_id, seq);

        CREATE TABLE IF NOT EXISTS sync_cursors (
            tenant_id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            cursor TEXT NOT NULL,
            advanced_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, device_id)
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: manual review queue for unresolvable conflicts
fn migrate_v2(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS manual_reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            remote_version INTEGER NOT NULL,
            local_value TEXT,
            remote_value TEXT,
            operation_id TEXT,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            UNIQUE (tenant_id, entity_type, entity_id, field, local_version, remote_version)
        );
        CREATE INDEX IF NOT EXISTS idx_manual_reviews_open
            ON manual_reviews(tenant_id, resolved_at);
        CREATE INDEX IF NOT EXISTS idx_manual_reviews_entity
            ON manual_reviews(tenant_id, entity_type, entity_id);

        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: server-confirmed version, tracked apart from the
/// locally numbered merge version
fn migrate_v3(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "ALTER TABLE records ADD COLUMN server_version INTEGER NOT NULL DEFAULT 0;
        UPDATE records SET server_version = version;

        INSERT INTO schema_version (version) VALUES (3);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v2_creates_manual_reviews_table() {
        let conn = setup();
        run(&conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'manual_reviews'
                )",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert!(exists);
    }

    #[test]
    fn test_migration_v3_backfills_server_version() {
        let conn = setup();
        migrate_v1(&conn).unwrap();
        migrate_v2(&conn).unwrap();
        conn.execute(
            "INSERT INTO records (tenant_id, entity_type, entity_id, version, updated_by, payload,
                                  updated_at)
             VALUES ('bistro', 'order', '42', 5, 'pos-1', '{}', 0)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();

        let server_version: i64 = conn
            .query_row("SELECT server_version FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(server_version, 5);
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }
}
