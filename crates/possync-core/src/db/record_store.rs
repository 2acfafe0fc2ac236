//! Record store implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{ActorId, FieldMap, Record, RecordKey, TenantId, Version};

/// Result of a [`RecordStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was stored
    Written,
    /// The stored copy is newer (or a tombstone) and was kept
    Dropped,
}

/// Trait for record storage operations
pub trait RecordStore {
    /// Get a record by key, tombstones included
    fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Store a record unless the stored copy has a higher version.
    ///
    /// A tombstone is never replaced by a live record of equal or lower version.
    fn put(&self, record: &Record) -> Result<PutOutcome>;

    /// Flag a record as having unconfirmed local changes
    fn mark_dirty(&self, key: &RecordKey) -> Result<()>;

    /// Clear the unconfirmed-changes flag
    fn clear_dirty(&self, key: &RecordKey) -> Result<()>;

    /// Set or clear the manual-review flag
    fn set_conflict_resolved(&self, key: &RecordKey, resolved: bool) -> Result<()>;

    /// One page of dirty records for a tenant, ordered by key, strictly after `after`
    fn scan_dirty_page(
        &self,
        tenant: &TenantId,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Physically remove tombstones created at or before `cutoff_ms` that no
    /// operation still references
    fn purge_tombstones(&self, tenant: &TenantId, cutoff_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `RecordStore`
pub struct SqliteRecordStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let payload: String = row.get(5)?;
        let payload: FieldMap = serde_json::from_str(&payload).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?;
        Ok(Record {
            key: RecordKey {
                tenant_id: TenantId::from_storage(row.get(0)?),
                entity_type: row.get(1)?,
                entity_id: row.get(2)?,
            },
            version: Version(row.get(3)?),
            server_version: Version(row.get(11)?),
            updated_by: ActorId::from_storage(row.get(4)?),
            payload,
            deleted: row.get::<_, i32>(6)? != 0,
            conflict_resolved: row.get::<_, i32>(7)? != 0,
            dirty: row.get::<_, i32>(8)? != 0,
            tombstoned_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn set_flag(&self, key: &RecordKey, column: &str, value: bool) -> Result<()> {
        self.conn.execute(
            &format!(
                "UPDATE records SET {column} = ?
                 WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?"
            ),
            params![
                i32::from(value),
                key.tenant_id.as_str(),
                key.entity_type,
                key.entity_id
            ],
        )?;
        Ok(())
    }
}

const RECORD_COLUMNS: &str = "tenant_id, entity_type, entity_id, version, updated_by, payload,
     deleted, conflict_resolved, dirty, tombstoned_at, updated_at, server_version";

impl RecordStore for SqliteRecordStore<'_> {
    fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?"
                ),
                params![key.tenant_id.as_str(), key.entity_type, key.entity_id],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &Record) -> Result<PutOutcome> {
        let now = chrono::Utc::now().timestamp_millis();
        let tombstoned_at = if record.deleted {
            Some(record.tombstoned_at.unwrap_or(now))
        } else {
            None
        };
        let payload = serde_json::to_string(&record.payload)?;

        let rows = self.conn.execute(
            "INSERT INTO records (tenant_id, entity_type, entity_id, version, updated_by, payload,
                                  deleted, conflict_resolved, dirty, tombstoned_at, updated_at,
                                  server_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (tenant_id, entity_type, entity_id) DO UPDATE SET
                 version = excluded.version,
                 server_version = MAX(records.server_version, excluded.server_version),
                 updated_by = excluded.updated_by,
                 payload = excluded.payload,
                 deleted = excluded.deleted,
                 conflict_resolved = excluded.conflict_resolved,
                 dirty = excluded.dirty,
                 tombstoned_at = CASE
                     WHEN excluded.deleted = 0 THEN NULL
                     ELSE COALESCE(records.tombstoned_at, excluded.tombstoned_at)
                 END,
                 updated_at = excluded.updated_at
             WHERE excluded.version >= records.version
               AND NOT (records.deleted = 1 AND excluded.deleted = 0
                        AND excluded.version <= records.version)",
            params![
                record.key.tenant_id.as_str(),
                record.key.entity_type,
                record.key.entity_id,
                record.version.0,
                record.updated_by.as_str(),
                payload,
                i32::from(record.deleted),
                i32::from(record.conflict_resolved),
                i32::from(record.dirty),
                tombstoned_at,
                now,
                record.server_version.0,
            ],
        )?;

        if rows == 0 {
            tracing::debug!(
                "Dropped stale write for {} at {}",
                record.key,
                record.version
            );
            return Ok(PutOutcome::Dropped);
        }
        Ok(PutOutcome::Written)
    }

    fn mark_dirty(&self, key: &RecordKey) -> Result<()> {
        self.set_flag(key, "dirty", true)
    }

    fn clear_dirty(&self, key: &RecordKey) -> Result<()> {
        self.set_flag(key, "dirty", false)
    }

    fn set_conflict_resolved(&self, key: &RecordKey, resolved: bool) -> Result<()> {
        self.set_flag(key, "conflict_resolved", resolved)
    }

    fn scan_dirty_page(
        &self,
        tenant: &TenantId,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let (after_type, after_id) = after.map_or(("", ""), |key| {
            (key.entity_type.as_str(), key.entity_id.as_str())
        });
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE tenant_id = ? AND dirty = 1
               AND (entity_type > ? OR (entity_type = ? AND entity_id > ?))
             ORDER BY entity_type, entity_id
             LIMIT ?"
        ))?;

        let records = stmt
            .query_map(
                params![
                    tenant.as_str(),
                    after_type,
                    after_type,
                    after_id,
                    limit as i64
                ],
                Self::parse_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn purge_tombstones(&self, tenant: &TenantId, cutoff_ms: i64) -> Result<usize> {
        let purged = self.conn.execute(
            "DELETE FROM records
             WHERE tenant_id = ?1 AND deleted = 1 AND dirty = 0
               AND tombstoned_at IS NOT NULL AND tombstoned_at <= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM operations o
                   WHERE o.tenant_id = records.tenant_id
                     AND o.entity_type = records.entity_type
                     AND o.entity_id = records.entity_id
               )",
            params![tenant.as_str(), cutoff_ms],
        )?;
        if purged > 0 {
            tracing::info!("Purged {purged} tombstones for tenant {tenant}");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn tenant() -> TenantId {
        TenantId::new("bistro").unwrap()
    }

    fn record(id: &str, version: i64, status: &str) -> Record {
        let payload: FieldMap = [("status".to_string(), json!(status))].into_iter().collect();
        Record::new(
            RecordKey::new(tenant(), "order", id).unwrap(),
            Version(version),
            ActorId::new("pos-1").unwrap(),
            payload,
        )
    }

    #[test]
    fn test_put_and_get() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            let order = record("42", 3, "placed");
            assert_eq!(store.put(&order)?, PutOutcome::Written);

            let fetched = store.get(&order.key)?.unwrap();
            assert_eq!(fetched.version, Version(3));
            assert_eq!(fetched.payload, order.payload);
            assert!(fetched.conflict_resolved);
            assert!(!fetched.dirty);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_server_version_is_kept_apart_from_version() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            let mut merged = record("42", 4, "picked_up");
            merged.server_version = Version(3);
            store.put(&merged)?;

            let fetched = store.get(&merged.key)?.unwrap();
            assert_eq!(fetched.version, Version(4));
            assert_eq!(fetched.server_version, Version(3));

            // a local edit carrying an older confirmed version never lowers it
            let mut edit = fetched.clone();
            edit.server_version = Version(1);
            store.put(&edit)?;
            assert_eq!(store.get(&merged.key)?.unwrap().server_version, Version(3));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_get_missing_returns_none() {
        let db = setup();
        let key = RecordKey::new(tenant(), "order", "nope").unwrap();
        let fetched = db
            .with_connection(|conn| SqliteRecordStore::new(conn).get(&key))
            .unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn test_lower_version_is_dropped() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            store.put(&record("42", 5, "ready"))?;
            assert_eq!(store.put(&record("42", 4, "placed"))?, PutOutcome::Dropped);
            assert_eq!(store.put(&record("42", 5, "picked_up"))?, PutOutcome::Written);

            let fetched = store.get(&record("42", 0, "").key)?.unwrap();
            assert_eq!(fetched.version, Version(5));
            assert_eq!(fetched.payload["status"], json!("picked_up"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_tombstone_is_not_resurrected() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            store.put(&record("42", 7, "ready").into_tombstone())?;
            assert_eq!(store.put(&record("42", 7, "ready"))?, PutOutcome::Dropped);
            assert_eq!(store.put(&record("42", 6, "ready"))?, PutOutcome::Dropped);

            let fetched = store.get(&record("42", 0, "").key)?.unwrap();
            assert!(fetched.deleted);
            assert!(fetched.tombstoned_at.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scan_dirty_is_restartable() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            for id in ["a", "b", "c", "d"] {
                store.put(&record(id, 1, "placed"))?;
            }
            for id in ["a", "c", "d"] {
                store.mark_dirty(&record(id, 0, "").key)?;
            }

            let first = store.scan_dirty_page(&tenant(), None, 2)?;
            let ids: Vec<_> = first.iter().map(|r| r.key.entity_id.as_str()).collect();
            assert_eq!(ids, vec!["a", "c"]);

            let rest = store.scan_dirty_page(&tenant(), Some(&first[1].key), 2)?;
            let ids: Vec<_> = rest.iter().map(|r| r.key.entity_id.as_str()).collect();
            assert_eq!(ids, vec!["d"]);

            store.clear_dirty(&record("c", 0, "").key)?;
            let again = store.scan_dirty_page(&tenant(), None, 10)?;
            assert_eq!(again.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_purge_tombstones_respects_cutoff() {
        let db = setup();
        db.with_connection(|conn| {
            let store = SqliteRecordStore::new(conn);
            let mut old = record("old", 2, "placed").into_tombstone();
            old.tombstoned_at = Some(1_000);
            store.put(&old)?;
            let mut fresh = record("fresh", 2, "placed").into_tombstone();
            fresh.tombstoned_at = Some(9_000);
            store.put(&fresh)?;
            store.put(&record("live", 2, "placed"))?;

            assert_eq!(store.purge_tombstones(&tenant(), 5_000)?, 1);
            assert!(store.get(&old.key)?.is_none());
            assert!(store.get(&fresh.key)?.is_some());
            Ok(())
        })
        .unwrap();
    }
}
