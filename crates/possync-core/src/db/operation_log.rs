//! Operation log implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::collections::HashSet;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    ActorId, FieldMap, Operation, OperationId, OperationKind, OperationStatus, RecordKey,
    TenantId, Version,
};

/// Trait for the durable queue of local mutations
pub trait OperationLog {
    /// Append an operation, assigning its queue position when unset.
    ///
    /// Fails with [`Error::DuplicateOperation`] if the id is already present.
    fn enqueue(&self, operation: &Operation) -> Result<Operation>;

    /// Fetch one operation
    fn get(&self, id: &OperationId) -> Result<Option<Operation>>;

    /// Due pending operations in queue order, at most one per entity.
    ///
    /// An entity whose oldest open operation is in flight or backing off
    /// contributes nothing, so later operations never overtake it.
    fn next_batch(&self, tenant: &TenantId, max_n: usize, now_ms: i64) -> Result<Vec<Operation>>;

    fn mark_in_flight(&self, id: &OperationId) -> Result<()>;

    /// Confirm the operation and remove it from the log
    fn mark_acknowledged(&self, id: &OperationId) -> Result<()>;

    fn mark_failed(&self, id: &OperationId, reason: &str) -> Result<()>;

    /// Retire an operation that a corrected replacement supersedes
    fn mark_conflicted(&self, id: &OperationId, reason: &str) -> Result<()>;

    /// Return a failed operation to the queue after `backoff`
    fn schedule_retry(&self, id: &OperationId, backoff: Duration, now_ms: i64) -> Result<()>;

    /// Pending and in-flight operations for one entity, in queue order
    fn open_for_entity(&self, key: &RecordKey) -> Result<Vec<Operation>>;

    /// Whether any unconfirmed (pending, in flight or failed) operation targets `key`
    fn has_unconfirmed(&self, key: &RecordKey) -> Result<bool>;

    /// Move pending operations of `key` computed against `from` onto a new base
    fn rebase(
        &self,
        key: &RecordKey,
        from: Version,
        to: Version,
        snapshot: &FieldMap,
    ) -> Result<usize>;

    /// Operations of a tenant, optionally filtered by status, in queue order
    fn list(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<Operation>>;

    /// Return operations stranded in flight by a crash to the queue, for one
    /// tenant or for all of them
    fn recover_in_flight(&self, tenant: Option<&TenantId>) -> Result<usize>;

    /// Failed operations and operations that reached `max_retry_count`
    fn surfaced_failures(&self, tenant: &TenantId, max_retry_count: u32) -> Result<Vec<Operation>>;

    /// Administratively drop a surfaced failure
    fn discard(&self, id: &OperationId, max_retry_count: u32) -> Result<Operation>;

    /// Remove conflicted rows last touched at or before `cutoff_ms`
    fn compact_conflicted(&self, tenant: &TenantId, cutoff_ms: i64) -> Result<usize>;
}

/// `SQLite` implementation of `OperationLog`
pub struct SqliteOperationLog<'a> {
    conn: &'a Connection,
}

const OPERATION_COLUMNS: &str = "operation_id, seq, tenant_id, entity_type, entity_id, kind,
     payload_delta, base_version, base_snapshot, updated_by, status, retry_count,
     next_retry_at, last_error, created_at";

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}

fn parsed_column<T>(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}

impl<'a> SqliteOperationLog<'a> {
    /// Create a new log with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
        Ok(Operation {
            operation_id: parsed_column::<OperationId>(row, 0)?,
            seq: row.get(1)?,
            key: RecordKey {
                tenant_id: TenantId::from_storage(row.get(2)?),
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
            },
            kind: parsed_column::<OperationKind>(row, 5)?,
            payload_delta: json_column(row, 6)?,
            base_version: Version(row.get(7)?),
            base_snapshot: json_column(row, 8)?,
            updated_by: ActorId::from_storage(row.get(9)?),
            status: parsed_column::<OperationStatus>(row, 10)?,
            retry_count: row.get(11)?,
            next_retry_at: row.get(12)?,
            last_error: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn query(&self, sql_filter: &str, params: impl rusqlite::Params) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations {sql_filter}"
        ))?;
        let operations = stmt
            .query_map(params, Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn status_of(&self, id: &OperationId) -> Result<OperationStatus> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM operations WHERE operation_id = ?",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.ok_or_else(|| Error::NotFound(format!("operation {id}")))?
            .parse()
    }

    /// Move `id` to `to`, enforcing the operation state machine
    fn transition(
        &self,
        id: &OperationId,
        to: OperationStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let from = self.status_of(id)?;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: *id,
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        self.conn.execute(
            "UPDATE operations
             SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?
             WHERE operation_id = ?",
            params![
                to.as_str(),
                last_error,
                chrono::Utc::now().timestamp_millis(),
                id.as_str()
            ],
        )?;
        Ok(())
    }
}

impl OperationLog for SqliteOperationLog<'_> {
    fn enqueue(&self, operation: &Operation) -> Result<Operation> {
        if self.get(&operation.operation_id)?.is_some() {
            return Err(Error::DuplicateOperation(operation.operation_id));
        }

        let mut stored = operation.clone();
        if stored.seq == 0 {
            stored.seq = self.conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM operations",
                [],
                |row| row.get(0),
            )?;
        }

        self.conn.execute(
            "INSERT INTO operations (operation_id, seq, tenant_id, entity_type, entity_id, kind,
                                     payload_delta, base_version, base_snapshot, updated_by,
                                     status, retry_count, next_retry_at, last_error,
                                     created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                stored.operation_id.as_str(),
                stored.seq,
                stored.key.tenant_id.as_str(),
                stored.key.entity_type,
                stored.key.entity_id,
                stored.kind.as_str(),
                serde_json::to_string(&stored.payload_delta)?,
                stored.base_version.0,
                serde_json::to_string(&stored.base_snapshot)?,
                stored.updated_by.as_str(),
                stored.status.as_str(),
                stored.retry_count,
                stored.next_retry_at,
                stored.last_error,
                stored.created_at,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;

        tracing::debug!(
            "Enqueued {} {} for {} (seq {})",
            stored.kind,
            stored.operation_id,
            stored.key,
            stored.seq
        );
        Ok(stored)
    }

    fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        let operation = self
            .conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = ?"),
                params![id.as_str()],
                Self::parse_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn next_batch(&self, tenant: &TenantId, max_n: usize, now_ms: i64) -> Result<Vec<Operation>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let open = self.query(
            "WHERE tenant_id = ? AND status IN ('pending', 'in_flight')
             ORDER BY seq, created_at",
            params![tenant.as_str()],
        )?;

        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for operation in open {
            // Only the head of each entity's queue is eligible
            if !seen.insert(operation.key.clone()) {
                continue;
            }
            if operation.status == OperationStatus::Pending && !operation.is_backing_off(now_ms) {
                batch.push(operation);
                if batch.len() >= max_n {
                    break;
                }
            }
        }
        Ok(batch)
    }

    fn mark_in_flight(&self, id: &OperationId) -> Result<()> {
        self.transition(id, OperationStatus::InFlight, None)
    }

    fn mark_acknowledged(&self, id: &OperationId) -> Result<()> {
        let from = self.status_of(id)?;
        if !from.can_transition_to(OperationStatus::Acknowledged) {
            return Err(Error::InvalidTransition {
                id: *id,
                from: from.as_str(),
                to: OperationStatus::Acknowledged.as_str(),
            });
        }
        self.conn.execute(
            "DELETE FROM operations WHERE operation_id = ?",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: &OperationId, reason: &str) -> Result<()> {
        self.transition(id, OperationStatus::Failed, Some(reason))
    }

    fn mark_conflicted(&self, id: &OperationId, reason: &str) -> Result<()> {
        self.transition(id, OperationStatus::Conflicted, Some(reason))
    }

    fn schedule_retry(&self, id: &OperationId, backoff: Duration, now_ms: i64) -> Result<()> {
        self.transition(id, OperationStatus::Pending, None)?;
        let backoff_ms = i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX);
        self.conn.execute(
            "UPDATE operations
             SET retry_count = retry_count + 1, next_retry_at = ?
             WHERE operation_id = ?",
            params![now_ms.saturating_add(backoff_ms), id.as_str()],
        )?;
        Ok(())
    }

    fn open_for_entity(&self, key: &RecordKey) -> Result<Vec<Operation>> {
        self.query(
            "WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?
               AND status IN ('pending', 'in_flight')
             ORDER BY seq, created_at",
            params![key.tenant_id.as_str(), key.entity_type, key.entity_id],
        )
    }

    fn has_unconfirmed(&self, key: &RecordKey) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM operations
                WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?
                  AND status IN ('pending', 'in_flight', 'failed')
            )",
            params![key.tenant_id.as_str(), key.entity_type, key.entity_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn rebase(
        &self,
        key: &RecordKey,
        from: Version,
        to: Version,
        snapshot: &FieldMap,
    ) -> Result<usize> {
        let rebased = self.conn.execute(
            "UPDATE operations
             SET base_version = ?, base_snapshot = ?, updated_at = ?
             WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?
               AND status = 'pending' AND base_version = ?",
            params![
                to.0,
                serde_json::to_string(snapshot)?,
                chrono::Utc::now().timestamp_millis(),
                key.tenant_id.as_str(),
                key.entity_type,
                key.entity_id,
                from.0,
            ],
        )?;
        if rebased > 0 {
            tracing::debug!("Rebased {rebased} operations of {key} from {from} to {to}");
        }
        Ok(rebased)
    }

    fn list(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<Operation>> {
        self.query(
            "WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY seq, created_at
             LIMIT ?3",
            params![tenant.as_str(), status.map(OperationStatus::as_str), limit as i64],
        )
    }

    fn recover_in_flight(&self, tenant: Option<&TenantId>) -> Result<usize> {
        let recovered = self.conn.execute(
            "UPDATE operations SET status = 'pending', updated_at = ?1
             WHERE status = 'in_flight' AND (?2 IS NULL OR tenant_id = ?2)",
            params![
                chrono::Utc::now().timestamp_millis(),
                tenant.map(TenantId::as_str)
            ],
        )?;
        if recovered > 0 {
            tracing::warn!("Returned {recovered} in-flight operations to the queue after restart");
        }
        Ok(recovered)
    }

    fn surfaced_failures(&self, tenant: &TenantId, max_retry_count: u32) -> Result<Vec<Operation>> {
        self.query(
            "WHERE tenant_id = ? AND (status = 'failed' OR retry_count >= ?)
               AND status != 'conflicted'
             ORDER BY seq, created_at",
            params![tenant.as_str(), max_retry_count],
        )
    }

    fn discard(&self, id: &OperationId, max_retry_count: u32) -> Result<Operation> {
        let operation = self
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))?;

        let discardable = operation.status == OperationStatus::Failed
            || (operation.status == OperationStatus::Pending
                && operation.retry_count >= max_retry_count);
        if !discardable {
            return Err(Error::InvalidInput(format!(
                "operation {id} is {} with {} retries; only failed operations or operations \
                 past {max_retry_count} retries can be discarded",
                operation.status, operation.retry_count
            )));
        }

        self.conn.execute(
            "DELETE FROM operations WHERE operation_id = ?",
            params![id.as_str()],
        )?;
        tracing::warn!(
            "Discarded operation {} for {} after {} retries",
            id,
            operation.key,
            operation.retry_count
        );
        Ok(operation)
    }

    fn compact_conflicted(&self, tenant: &TenantId, cutoff_ms: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM operations
             WHERE tenant_id = ? AND status = 'conflicted' AND updated_at <= ?",
            params![tenant.as_str(), cutoff_ms],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("bistro").unwrap()
    }

    fn op(id: &str, status: &str) -> Operation {
        let delta: FieldMap = [("status".to_string(), json!(status))].into_iter().collect();
        Operation::new(
            RecordKey::new(tenant(), "order", id).unwrap(),
            OperationKind::StatusTransition,
            delta,
            Version(5),
            FieldMap::new(),
            ActorId::new("pos-a").unwrap(),
        )
    }

    fn with_log<T>(f: impl FnOnce(&SqliteOperationLog<'_>) -> Result<T>) -> T {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| f(&SqliteOperationLog::new(conn)))
            .unwrap()
    }

    #[test]
    fn test_enqueue_assigns_increasing_seq() {
        with_log(|log| {
            let first = log.enqueue(&op("1", "ready"))?;
            let second = log.enqueue(&op("2", "ready"))?;
            assert!(second.seq > first.seq);
            assert_eq!(log.get(&first.operation_id)?.unwrap().seq, first.seq);
            Ok(())
        });
    }

    #[test]
    fn test_duplicate_enqueue_is_rejected() {
        with_log(|log| {
            let operation = op("1", "ready");
            log.enqueue(&operation)?;
            let error = log.enqueue(&operation).unwrap_err();
            assert!(matches!(error, Error::DuplicateOperation(id) if id == operation.operation_id));
            Ok(())
        });
    }

    #[test]
    fn test_next_batch_respects_per_entity_fifo() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            let b1 = log.enqueue(&op("b", "ready"))?;
            let a2 = log.enqueue(&op("a", "picked_up"))?;

            let batch = log.next_batch(&tenant(), 10, 0)?;
            let ids: Vec<_> = batch.iter().map(|o| o.operation_id).collect();
            assert_eq!(ids, vec![a1.operation_id, b1.operation_id]);

            // While a1 is in flight nothing else for entity a may go
            log.mark_in_flight(&a1.operation_id)?;
            let batch = log.next_batch(&tenant(), 10, 0)?;
            let ids: Vec<_> = batch.iter().map(|o| o.operation_id).collect();
            assert_eq!(ids, vec![b1.operation_id]);

            log.mark_acknowledged(&a1.operation_id)?;
            let batch = log.next_batch(&tenant(), 10, 0)?;
            let ids: Vec<_> = batch.iter().map(|o| o.operation_id).collect();
            assert_eq!(ids, vec![b1.operation_id, a2.operation_id]);
            Ok(())
        });
    }

    #[test]
    fn test_backing_off_head_blocks_entity() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            log.enqueue(&op("a", "picked_up"))?;

            log.mark_in_flight(&a1.operation_id)?;
            log.mark_failed(&a1.operation_id, "connection reset")?;
            log.schedule_retry(&a1.operation_id, Duration::from_secs(2), 10_000)?;

            assert!(log.next_batch(&tenant(), 10, 11_000)?.is_empty());

            let batch = log.next_batch(&tenant(), 10, 12_000)?;
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].operation_id, a1.operation_id);
            assert_eq!(batch[0].retry_count, 1);
            assert_eq!(batch[0].last_error.as_deref(), Some("connection reset"));
            Ok(())
        });
    }

    #[test]
    fn test_acknowledged_operation_is_removed() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            log.mark_in_flight(&a1.operation_id)?;
            log.mark_acknowledged(&a1.operation_id)?;
            assert!(log.get(&a1.operation_id)?.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            let error = log.mark_acknowledged(&a1.operation_id).unwrap_err();
            assert!(matches!(error, Error::InvalidTransition { .. }));
            Ok(())
        });
    }

    #[test]
    fn test_terminal_failure_does_not_block_entity() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            let a2 = log.enqueue(&op("a", "picked_up"))?;
            log.mark_in_flight(&a1.operation_id)?;
            log.mark_failed(&a1.operation_id, "permission denied")?;

            let batch = log.next_batch(&tenant(), 10, 0)?;
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].operation_id, a2.operation_id);
            assert!(log.has_unconfirmed(&a1.key)?);
            Ok(())
        });
    }

    #[test]
    fn test_rebase_moves_matching_pending_operations() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            let a2 = log.enqueue(&op("a", "picked_up"))?;
            log.mark_in_flight(&a1.operation_id)?;

            let snapshot: FieldMap = [("status".to_string(), json!("ready"))].into_iter().collect();
            let rebased = log.rebase(&a1.key, Version(5), Version(6), &snapshot)?;
            assert_eq!(rebased, 1);

            let a2 = log.get(&a2.operation_id)?.unwrap();
            assert_eq!(a2.base_version, Version(6));
            assert_eq!(a2.base_snapshot, snapshot);
            assert_eq!(log.get(&a1.operation_id)?.unwrap().base_version, Version(5));
            Ok(())
        });
    }

    #[test]
    fn test_recover_in_flight_after_restart() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            log.mark_in_flight(&a1.operation_id)?;
            let other = TenantId::new("other").unwrap();
            assert_eq!(log.recover_in_flight(Some(&other))?, 0);
            assert_eq!(log.recover_in_flight(None)?, 1);
            assert_eq!(
                log.get(&a1.operation_id)?.unwrap().status,
                OperationStatus::Pending
            );
            Ok(())
        });
    }

    #[test]
    fn test_discard_requires_surfaced_failure() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            assert!(log.discard(&a1.operation_id, 3).is_err());

            log.mark_in_flight(&a1.operation_id)?;
            log.mark_failed(&a1.operation_id, "entity deleted")?;
            assert_eq!(log.surfaced_failures(&tenant(), 3)?.len(), 1);

            let discarded = log.discard(&a1.operation_id, 3)?;
            assert_eq!(discarded.status, OperationStatus::Failed);
            assert!(log.get(&a1.operation_id)?.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_list_filters_by_status() {
        with_log(|log| {
            let a1 = log.enqueue(&op("a", "ready"))?;
            log.enqueue(&op("b", "ready"))?;
            log.mark_in_flight(&a1.operation_id)?;

            assert_eq!(log.list(&tenant(), None, 10)?.len(), 2);
            let in_flight = log.list(&tenant(), Some(OperationStatus::InFlight), 10)?;
            assert_eq!(in_flight.len(), 1);
            assert_eq!(in_flight[0].operation_id, a1.operation_id);
            Ok(())
        });
    }
}
