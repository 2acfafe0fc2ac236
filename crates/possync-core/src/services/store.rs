//! Shared store service used by the application and the sync client.
//!
//! Application writes go through [`SyncStore::enqueue`]; the sync client uses
//! the crate-internal steps further down. Every step that touches a record
//! together with its operations runs under that record's entity lock inside
//! one short transaction.

use std::collections::VecDeque;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::conflict::{resolve, strip_lost_fields, LocalChange, ResolutionReport};
use crate::db::{
    CursorStore, Database, EntityLocks, OperationLog, PutOutcome, RecordStore, ReviewRepository,
    SqliteCursorStore, SqliteOperationLog, SqliteRecordStore, SqliteReviewRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ActorId, DeviceId, FieldMap, ManualReview, Operation, OperationId, OperationKind,
    OperationStatus, Record, RecordKey, SyncCursor, TenantId, Version,
};
use crate::sync::{Backoff, PushOutcome};
use crate::util::now_ms;

const DIRTY_SCAN_PAGE_SIZE: usize = 100;

/// How an open manual review is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewChoice {
    /// Keep the server value; nothing is pushed
    KeepRemote,
    /// Push the local value as a new update
    KeepLocal,
}

/// Rows removed by [`SyncStore::gc`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub purged_tombstones: usize,
    pub compacted_operations: usize,
}

/// Local effect of a conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reconciliation {
    pub report: ResolutionReport,
    pub reviews_queued: usize,
    /// Operations retired because nothing of their intent survived
    pub superseded: usize,
    /// Operations replaced by a corrected copy on the new base
    pub requeued: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PushApplied {
    Acknowledged { version: Version },
    Resolved(Reconciliation),
    Rejected { reason: String },
    /// The operation left the in-flight state while the request was out
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PullApplied {
    Written,
    /// The stored copy was already at a higher version
    Dropped,
    /// The local copy carries unconfirmed changes on top of this version
    Skipped,
    Merged(Reconciliation),
}

/// Thread-safe local store for records, operations, cursors and reviews.
pub struct SyncStore {
    db: Database,
    locks: EntityLocks,
    config: SyncConfig,
}

impl SyncStore {
    /// Open the store at the given path, returning operations stranded in
    /// flight by a previous crash to the queue.
    pub fn open(path: impl AsRef<Path>, config: SyncConfig) -> Result<Self> {
        Self::from_database(Database::open(path)?, config)
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory(config: SyncConfig) -> Result<Self> {
        Self::from_database(Database::open_in_memory()?, config)
    }

    pub fn from_database(db: Database, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = Self {
            db,
            locks: EntityLocks::new(),
            config,
        };
        store.recover_in_flight(None)?;
        Ok(store)
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    fn write_entity<T>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        self.locks.with_entity(key, || self.db.transaction(f))
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_base(), self.config.backoff_cap())
    }

    // ---------------------------------------------------------------------
    // Application API
    // ---------------------------------------------------------------------

    /// Apply a local mutation and queue it for the server.
    ///
    /// The record update and the queued operation commit together. Rejections
    /// by the server are reported later through sync results, never here.
    pub fn enqueue(
        &self,
        key: &RecordKey,
        kind: OperationKind,
        delta: FieldMap,
        actor: &ActorId,
    ) -> Result<Operation> {
        self.enqueue_operation(Operation::new(
            key.clone(),
            kind,
            delta,
            Version::PROVISIONAL,
            FieldMap::new(),
            actor.clone(),
        ))
    }

    /// Queue an operation whose id the caller already assigned.
    ///
    /// Enqueueing the same operation id again returns the queued operation and
    /// leaves the record untouched, so a caller unsure whether an earlier
    /// attempt committed can simply repeat it. The base version and snapshot
    /// are always taken from the local record.
    pub fn enqueue_operation(&self, operation: Operation) -> Result<Operation> {
        let key = operation.key.clone();
        let kind = operation.kind;
        if kind != OperationKind::Delete && operation.payload_delta.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{kind} for {key} must change at least one field"
            )));
        }

        self.write_entity(&key, |conn| {
            let records = SqliteRecordStore::new(conn);
            let log = SqliteOperationLog::new(conn);

            if let Some(queued) = log.get(&operation.operation_id)? {
                tracing::debug!("{} is already queued", operation.operation_id);
                return Ok(queued);
            }

            let actor = operation.updated_by.clone();
            let mut record = match (kind, records.get(&key)?) {
                (OperationKind::Create, None) => Record::new(
                    key.clone(),
                    Version::PROVISIONAL,
                    actor.clone(),
                    FieldMap::new(),
                ),
                (OperationKind::Create, Some(_)) => {
                    return Err(Error::InvalidInput(format!("{key} already exists")));
                }
                (_, None) => return Err(Error::NotFound(format!("record {key}"))),
                (_, Some(record)) if record.deleted => {
                    return Err(Error::InvalidInput(format!("{key} is deleted")));
                }
                (_, Some(record)) => record,
            };

            let operation = Operation {
                base_version: record.server_version,
                base_snapshot: record.payload.clone(),
                status: OperationStatus::Pending,
                retry_count: 0,
                next_retry_at: None,
                last_error: None,
                seq: 0,
                ..operation
            };

            record.apply_delta(&operation.payload_delta);
            record.deleted = kind == OperationKind::Delete;
            record.updated_by = actor;
            record.dirty = true;
            record.updated_at = now_ms();
            records.put(&record)?;

            log.enqueue(&operation)
        })
    }

    /// Current local copy of a record, tombstones included
    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.db
            .with_reader(|conn| SqliteRecordStore::new(conn).get(key))
    }

    /// Iterate over the tenant's records with unconfirmed local changes
    pub fn scan_dirty(&self, tenant: &TenantId) -> DirtyScan<'_> {
        self.scan_dirty_after(tenant, None)
    }

    /// Resume a dirty scan after the last key a previous scan yielded
    pub fn scan_dirty_after(&self, tenant: &TenantId, after: Option<RecordKey>) -> DirtyScan<'_> {
        DirtyScan {
            store: self,
            tenant: tenant.clone(),
            fetched_until: after.clone(),
            last_yielded: after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn operation(&self, id: &OperationId) -> Result<Option<Operation>> {
        self.db
            .with_reader(|conn| SqliteOperationLog::new(conn).get(id))
    }

    pub fn operations(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<Operation>> {
        self.db
            .with_reader(|conn| SqliteOperationLog::new(conn).list(tenant, status, limit))
    }

    /// Operations the user should see: terminally failed, or past the retry ceiling
    pub fn surfaced_failures(&self, tenant: &TenantId) -> Result<Vec<Operation>> {
        self.db.with_reader(|conn| {
            SqliteOperationLog::new(conn).surfaced_failures(tenant, self.config.max_retry_count)
        })
    }

    /// Drop a surfaced failure from the log.
    ///
    /// The local copy keeps the abandoned values until a newer server version
    /// arrives.
    pub fn discard(&self, id: &OperationId) -> Result<Operation> {
        let operation = self
            .operation(id)?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))?;

        self.write_entity(&operation.key, |conn| {
            let log = SqliteOperationLog::new(conn);
            let discarded = log.discard(id, self.config.max_retry_count)?;
            if !log.has_unconfirmed(&discarded.key)? {
                SqliteRecordStore::new(conn).clear_dirty(&discarded.key)?;
            }
            Ok(discarded)
        })
    }

    pub fn reviews(
        &self,
        tenant: &TenantId,
        open_only: bool,
        limit: usize,
    ) -> Result<Vec<ManualReview>> {
        self.db.with_reader(|conn| {
            SqliteReviewRepository::new(conn).list(tenant, open_only, limit)
        })
    }

    /// Settle an open manual review.
    ///
    /// Returns the corrective operation when the local value is kept. The
    /// record's `conflict_resolved` flag is restored once no review remains open.
    pub fn resolve_review(
        &self,
        id: i64,
        choice: ReviewChoice,
        actor: &ActorId,
    ) -> Result<Option<Operation>> {
        let review = self
            .db
            .with_reader(|conn| SqliteReviewRepository::new(conn).get(id))?
            .ok_or_else(|| Error::NotFound(format!("review {id}")))?;
        if !review.is_open() {
            return Err(Error::InvalidInput(format!("review {id} is already resolved")));
        }

        let operation = match choice {
            ReviewChoice::KeepRemote => None,
            ReviewChoice::KeepLocal => {
                let value = review.local_value.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("review {id} has no local value to keep"))
                })?;
                let delta: FieldMap = [(review.field.clone(), value)].into_iter().collect();
                Some(self.enqueue(&review.key, OperationKind::Update, delta, actor)?)
            }
        };

        self.write_entity(&review.key, |conn| {
            let reviews = SqliteReviewRepository::new(conn);
            reviews.mark_resolved(id, now_ms())?;
            if reviews.open_count(&review.key)? == 0 {
                SqliteRecordStore::new(conn).set_conflict_resolved(&review.key, true)?;
            }
            Ok(())
        })?;

        tracing::info!("Resolved review {id} on {} ({choice:?})", review.key);
        Ok(operation)
    }

    /// Purge old tombstones and compact superseded operation rows
    pub fn gc(&self, tenant: &TenantId, now_ms: i64) -> Result<GcReport> {
        let cutoff = now_ms.saturating_sub(self.config.retention_ms());
        self.db.transaction(|conn| {
            let compacted_operations =
                SqliteOperationLog::new(conn).compact_conflicted(tenant, cutoff)?;
            let purged_tombstones = SqliteRecordStore::new(conn).purge_tombstones(tenant, cutoff)?;
            Ok(GcReport {
                purged_tombstones,
                compacted_operations,
            })
        })
    }

    /// Queue a full-snapshot operation for every dirty record that has no
    /// unconfirmed operation left in the log.
    pub fn rebuild_operations_from_dirty(
        &self,
        tenant: &TenantId,
        actor: &ActorId,
    ) -> Result<usize> {
        let mut keys = Vec::new();
        for record in self.scan_dirty(tenant) {
            keys.push(record?.key);
        }

        let mut rebuilt = 0;
        for key in keys {
            let queued = self.write_entity(&key, |conn| {
                let records = SqliteRecordStore::new(conn);
                let log = SqliteOperationLog::new(conn);
                if log.has_unconfirmed(&key)? {
                    return Ok(false);
                }
                let Some(record) = records.get(&key)?.filter(|record| record.dirty) else {
                    return Ok(false);
                };

                let kind = if record.deleted {
                    OperationKind::Delete
                } else if record.server_version.is_provisional() {
                    OperationKind::Create
                } else {
                    OperationKind::Update
                };
                let delta = if kind == OperationKind::Delete {
                    FieldMap::new()
                } else {
                    record.payload.clone()
                };
                if kind != OperationKind::Delete && delta.is_empty() {
                    records.clear_dirty(&key)?;
                    return Ok(false);
                }

                // The server-side base payload is unknown, so every field counts as changed
                let operation = Operation::new(
                    key.clone(),
                    kind,
                    delta,
                    record.server_version,
                    FieldMap::new(),
                    actor.clone(),
                );
                log.enqueue(&operation)?;
                Ok(true)
            })?;
            if queued {
                rebuilt += 1;
            }
        }

        if rebuilt > 0 {
            tracing::warn!("Rebuilt {rebuilt} operations from dirty records of {tenant}");
        }
        Ok(rebuilt)
    }

    pub fn cursor(&self, tenant: &TenantId, device: &DeviceId) -> Result<SyncCursor> {
        self.db
            .with_reader(|conn| SqliteCursorStore::new(conn).get(tenant, device))
    }

    // ---------------------------------------------------------------------
    // Sync steps
    // ---------------------------------------------------------------------

    pub(crate) fn recover_in_flight(&self, tenant: Option<&TenantId>) -> Result<usize> {
        self.db
            .transaction(|conn| SqliteOperationLog::new(conn).recover_in_flight(tenant))
    }

    /// Select the next push batch and move it in flight
    pub(crate) fn take_push_batch(
        &self,
        tenant: &TenantId,
        now_ms: i64,
    ) -> Result<Vec<Operation>> {
        self.db.transaction(|conn| {
            let log = SqliteOperationLog::new(conn);
            let mut batch = log.next_batch(tenant, self.config.batch_size, now_ms)?;
            for operation in &mut batch {
                log.mark_in_flight(&operation.operation_id)?;
                operation.status = OperationStatus::InFlight;
            }
            Ok(batch)
        })
    }

    /// Fail in-flight operations after a transport failure and schedule their retry
    pub(crate) fn retry_later(
        &self,
        operations: &[Operation],
        reason: &str,
        now_ms: i64,
    ) -> Result<()> {
        let backoff = self.backoff();
        self.db.transaction(|conn| {
            let log = SqliteOperationLog::new(conn);
            for operation in operations {
                let still_in_flight = log
                    .get(&operation.operation_id)?
                    .is_some_and(|current| current.status == OperationStatus::InFlight);
                if !still_in_flight {
                    continue;
                }
                log.mark_failed(&operation.operation_id, reason)?;
                let delay = backoff.delay(operation.retry_count);
                log.schedule_retry(&operation.operation_id, delay, now_ms)?;
                tracing::warn!(
                    "Retrying {} for {} in {:?} (attempt {}): {}",
                    operation.operation_id,
                    operation.key,
                    delay,
                    operation.retry_count + 1,
                    reason
                );
            }
            Ok(())
        })
    }

    /// Apply the server's verdict on one pushed operation
    pub(crate) fn apply_push_outcome(
        &self,
        operation: &Operation,
        outcome: &PushOutcome,
    ) -> Result<PushApplied> {
        let key = &operation.key;
        self.write_entity(key, |conn| {
            let records = SqliteRecordStore::new(conn);
            let log = SqliteOperationLog::new(conn);

            let in_flight = log
                .get(&operation.operation_id)?
                .is_some_and(|current| current.status == OperationStatus::InFlight);
            if !in_flight {
                return Ok(PushApplied::Skipped);
            }

            match outcome {
                PushOutcome::Accepted { version } => {
                    log.mark_acknowledged(&operation.operation_id)?;

                    let mut snapshot = operation.base_snapshot.clone();
                    for (field, value) in &operation.payload_delta {
                        snapshot.insert(field.clone(), value.clone());
                    }
                    log.rebase(key, operation.base_version, *version, &snapshot)?;

                    if let Some(mut record) = records.get(key)? {
                        record.version = record.version.max(*version);
                        record.server_version = record.server_version.max(*version);
                        record.dirty = log.has_unconfirmed(key)?;
                        records.put(&record)?;
                    }
                    tracing::debug!("{} acknowledged at {version}", operation.operation_id);
                    Ok(PushApplied::Acknowledged { version: *version })
                }
                PushOutcome::RejectedStale { .. } => {
                    let Some(remote) = outcome.stale_record(key) else {
                        return Ok(PushApplied::Skipped);
                    };
                    let reconciliation = self
                        .reconcile(conn, &remote, Some(operation))?
                        .ok_or_else(|| {
                            Error::Database(format!(
                                "in-flight operation {} missing from log",
                                operation.operation_id
                            ))
                        })?;
                    Ok(PushApplied::Resolved(reconciliation))
                }
                PushOutcome::RejectedInvalid { reason } => {
                    log.mark_failed(&operation.operation_id, reason)?;
                    tracing::warn!(
                        "Server rejected {} for {}: {}",
                        operation.operation_id,
                        key,
                        reason
                    );
                    Ok(PushApplied::Rejected {
                        reason: reason.clone(),
                    })
                }
            }
        })
    }

    /// Apply one record pulled from the server
    pub(crate) fn apply_pulled(&self, mut remote: Record) -> Result<PullApplied> {
        remote.server_version = remote.version;
        let key = remote.key.clone();
        self.write_entity(&key, |conn| {
            let records = SqliteRecordStore::new(conn);
            let log = SqliteOperationLog::new(conn);
            let reviews = SqliteReviewRepository::new(conn);

            if let Some(local) = records.get(&key)?.filter(|local| local.dirty) {
                if remote.version <= local.server_version {
                    return Ok(PullApplied::Skipped);
                }
                if let Some(reconciliation) = self.reconcile(conn, &remote, None)? {
                    return Ok(PullApplied::Merged(reconciliation));
                }
            }

            let mut incoming = remote;
            incoming.dirty = log.has_unconfirmed(&key)?;
            incoming.conflict_resolved =
                incoming.conflict_resolved && reviews.open_count(&key)? == 0;
            match records.put(&incoming)? {
                PutOutcome::Written => Ok(PullApplied::Written),
                PutOutcome::Dropped => Ok(PullApplied::Dropped),
            }
        })
    }

    pub(crate) fn advance_cursor(
        &self,
        tenant: &TenantId,
        device: &DeviceId,
        cursor: &SyncCursor,
    ) -> Result<()> {
        self.db
            .transaction(|conn| SqliteCursorStore::new(conn).advance(tenant, device, cursor))
    }

    /// Resolve the open operations of `remote.key` against the server copy,
    /// rewrite them onto the server version and store the merged record.
    ///
    /// `stale` is the in-flight operation the server just rejected, if any.
    /// Returns `None` when the entity has no open operation.
    fn reconcile(
        &self,
        conn: &Connection,
        remote: &Record,
        stale: Option<&Operation>,
    ) -> Result<Option<Reconciliation>> {
        let records = SqliteRecordStore::new(conn);
        let log = SqliteOperationLog::new(conn);
        let reviews = SqliteReviewRepository::new(conn);
        let key = &remote.key;

        let open = log.open_for_entity(key)?;
        let Some(change) = LocalChange::aggregate(&open) else {
            return Ok(None);
        };
        let policy = self.config.policies.policy_for(&key.entity_type);
        let resolution = resolve(&change, remote, policy);
        let intent_survives = resolution.residual.is_some();

        let mut superseded = 0;
        let mut requeued = 0;
        for operation in &open {
            let delta = strip_lost_fields(&operation.payload_delta, &resolution.report);
            let kind = match operation.kind {
                OperationKind::Create => OperationKind::Update,
                kind => kind,
            };
            let survives =
                intent_survives && (!delta.is_empty() || kind == OperationKind::Delete);

            if !survives {
                log.mark_conflicted(
                    &operation.operation_id,
                    &format!("superseded by server {}", remote.version),
                )?;
                superseded += 1;
                continue;
            }

            let is_stale = stale.is_some_and(|stale| stale.operation_id == operation.operation_id);
            if is_stale || delta != operation.payload_delta || kind != operation.kind {
                log.mark_conflicted(
                    &operation.operation_id,
                    &format!("rewritten against server {}", remote.version),
                )?;
                let mut corrected =
                    operation.corrected(delta, remote.version, remote.payload.clone());
                corrected.kind = kind;
                log.enqueue(&corrected)?;
                requeued += 1;
            } else if operation.base_version != remote.version {
                log.rebase(key, operation.base_version, remote.version, &remote.payload)?;
            }
        }

        let detected_at = now_ms();
        let mut reviews_queued = 0;
        for item in resolution.report.review_items() {
            let queued = reviews.record(&ManualReview {
                id: 0,
                key: key.clone(),
                field: item.field.clone(),
                local_version: change.base_version,
                remote_version: remote.version,
                local_value: item.local_value.clone(),
                remote_value: item.remote_value.clone(),
                operation_id: change.operation_id,
                detected_at,
                resolved_at: None,
            })?;
            if queued {
                reviews_queued += 1;
            }
        }

        let mut merged = resolution.merged;
        merged.server_version = remote.version;
        merged.dirty = log.has_unconfirmed(key)?;
        merged.conflict_resolved = remote.conflict_resolved && reviews.open_count(key)? == 0;
        if records.put(&merged)? == PutOutcome::Dropped {
            if merged.dirty {
                records.mark_dirty(key)?;
            } else {
                records.clear_dirty(key)?;
            }
            records.set_conflict_resolved(key, merged.conflict_resolved)?;
        }

        tracing::info!(
            "Resolved {} against server {}: {} superseded, {} requeued, {} reviews",
            key,
            remote.version,
            superseded,
            requeued,
            reviews_queued
        );

        Ok(Some(Reconciliation {
            report: resolution.report,
            reviews_queued,
            superseded,
            requeued,
        }))
    }
}

/// Lazy, restartable iterator over dirty records.
///
/// Records are fetched a page at a time in key order; [`DirtyScan::last_key`]
/// can be passed to [`SyncStore::scan_dirty_after`] to resume later.
pub struct DirtyScan<'a> {
    store: &'a SyncStore,
    tenant: TenantId,
    fetched_until: Option<RecordKey>,
    last_yielded: Option<RecordKey>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl DirtyScan<'_> {
    pub const fn last_key(&self) -> Option<&RecordKey> {
        self.last_yielded.as_ref()
    }
}

impl Iterator for DirtyScan<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.store.db.with_reader(|conn| {
                SqliteRecordStore::new(conn).scan_dirty_page(
                    &self.tenant,
                    self.fetched_until.as_ref(),
                    DIRTY_SCAN_PAGE_SIZE,
                )
            });
            match page {
                Ok(page) => {
                    self.exhausted = page.len() < DIRTY_SCAN_PAGE_SIZE;
                    if let Some(last) = page.last() {
                        self.fetched_until = Some(last.key.clone());
                    }
                    self.buffer.extend(page);
                }
                Err(error) => {
                    self.exhausted = true;
                    return Some(Err(error));
                }
            }
        }

        let record = self.buffer.pop_front()?;
        self.last_yielded = Some(record.key.clone());
        Some(Ok(record))
    }
}
