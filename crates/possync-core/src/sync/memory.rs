//! In-memory reference server.
//!
//! Implements the server half of the protocol: version assignment, dedup on
//! `operation_id`, stale and invalid rejections, and a change log addressed by
//! cursors. Faults can be injected to exercise retry and recovery paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{
    OperationResult, PullPage, PushOutcome, Transport, TransportError, TransportResult,
};
use crate::models::{
    ActorId, FieldMap, Operation, OperationId, OperationKind, Record, RecordKey, SyncCursor,
    TenantId, Version,
};

#[derive(Debug, Default)]
struct ServerState {
    records: BTreeMap<RecordKey, Record>,
    /// Change sequence -> record; one entry per record, at its latest change
    changes: BTreeMap<u64, RecordKey>,
    change_of: HashMap<RecordKey, u64>,
    next_change: u64,
    results: HashMap<OperationId, PushOutcome>,
    applied: usize,
    faults: Faults,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    failing_pushes: usize,
    lost_push_responses: usize,
    /// Pull calls, counted from 1, that fail
    failing_pulls: BTreeSet<usize>,
    pull_calls: usize,
    invalid: HashMap<RecordKey, String>,
    latency: Duration,
}

#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current server copy of a record
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.state().records.get(key).cloned()
    }

    /// Operations applied so far; duplicates are not counted
    pub fn applied_count(&self) -> usize {
        self.state().applied
    }

    /// Write directly on the server, as another device would.
    ///
    /// Creates the record at version 1 when it does not exist yet.
    pub fn write(&self, key: &RecordKey, delta: FieldMap, actor: &ActorId) -> Version {
        let mut state = self.state();
        let mut record = state.records.get(key).cloned().unwrap_or_else(|| {
            Record::new(key.clone(), Version::PROVISIONAL, actor.clone(), FieldMap::new())
        });
        record.apply_delta(&delta);
        record.version = record.version.next();
        record.updated_by = actor.clone();
        state.store(record)
    }

    /// Tombstone a record on the server
    pub fn delete(&self, key: &RecordKey, actor: &ActorId) -> Option<Version> {
        let mut state = self.state();
        let mut record = state.records.get(key).cloned()?;
        record.deleted = true;
        record.version = record.version.next();
        record.updated_by = actor.clone();
        Some(state.store(record))
    }

    /// Refuse every network call while offline
    pub fn set_offline(&self, offline: bool) {
        self.state().faults.offline = offline;
    }

    /// Fail the next `count` pushes before they reach the server
    pub fn fail_next_pushes(&self, count: usize) {
        self.state().faults.failing_pushes = count;
    }

    /// Apply the next `count` pushes but drop their responses
    pub fn lose_next_push_responses(&self, count: usize) {
        self.state().faults.lost_push_responses = count;
    }

    /// Fail the `nth` pull call from now on (1 is the next call)
    pub fn fail_pull_call(&self, nth: usize) {
        let mut state = self.state();
        let call = state.faults.pull_calls + nth;
        state.faults.failing_pulls.insert(call);
    }

    /// Reject operations on `key` as invalid
    pub fn reject_entity(&self, key: &RecordKey, reason: impl Into<String>) {
        self.state().faults.invalid.insert(key.clone(), reason.into());
    }

    /// Delay every response
    pub fn set_latency(&self, latency: Duration) {
        self.state().faults.latency = latency;
    }

    async fn delay(&self) {
        let latency = self.state().faults.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl ServerState {
    fn store(&mut self, record: Record) -> Version {
        let version = record.version;
        self.next_change += 1;
        if let Some(previous) = self.change_of.insert(record.key.clone(), self.next_change) {
            self.changes.remove(&previous);
        }
        self.changes.insert(self.next_change, record.key.clone());
        self.records.insert(record.key.clone(), record);
        version
    }

    fn apply(&mut self, tenant: &TenantId, operation: &Operation) -> PushOutcome {
        if let Some(outcome) = self.results.get(&operation.operation_id) {
            return outcome.clone();
        }
        let outcome = self.decide(tenant, operation);
        if matches!(outcome, PushOutcome::Accepted { .. }) {
            self.applied += 1;
        }
        self.results.insert(operation.operation_id, outcome.clone());
        outcome
    }

    fn decide(&mut self, tenant: &TenantId, operation: &Operation) -> PushOutcome {
        if &operation.key.tenant_id != tenant {
            return PushOutcome::RejectedInvalid {
                reason: format!("operation targets tenant {}", operation.key.tenant_id),
            };
        }
        if let Some(reason) = self.faults.invalid.get(&operation.key) {
            return PushOutcome::RejectedInvalid {
                reason: reason.clone(),
            };
        }

        let current = self.records.get(&operation.key).cloned();
        let mut record = match (operation.kind, current) {
            (OperationKind::Create, None) => Record::new(
                operation.key.clone(),
                Version::PROVISIONAL,
                operation.updated_by.clone(),
                FieldMap::new(),
            ),
            (_, None) => {
                return PushOutcome::RejectedInvalid {
                    reason: format!("unknown record {}", operation.key),
                };
            }
            (_, Some(current))
                if current.deleted || current.version > operation.base_version =>
            {
                return PushOutcome::RejectedStale {
                    version: current.version,
                    payload: current.payload,
                    deleted: current.deleted,
                    updated_by: Some(current.updated_by),
                };
            }
            (_, Some(current)) => current,
        };

        record.apply_delta(&operation.payload_delta);
        record.deleted = operation.kind == OperationKind::Delete;
        record.version = record.version.next();
        record.updated_by = operation.updated_by.clone();
        PushOutcome::Accepted {
            version: self.store(record),
        }
    }

    fn page(
        &self,
        tenant: &TenantId,
        cursor: &SyncCursor,
        limit: usize,
    ) -> TransportResult<PullPage> {
        let after = if cursor.is_initial() {
            0
        } else {
            cursor.as_str().parse::<u64>().map_err(|_| {
                TransportError::Status {
                    status: 400,
                    message: format!("malformed cursor {cursor}"),
                }
            })?
        };

        let mut changes = self
            .changes
            .range(after + 1..)
            .filter(|(_, key)| &key.tenant_id == tenant);
        let mut records = Vec::new();
        let mut last = after;
        for (change, key) in changes.by_ref().take(limit) {
            if let Some(record) = self.records.get(key) {
                records.push(record.clone());
            }
            last = *change;
        }
        let has_more = changes.next().is_some();

        Ok(PullPage {
            records,
            next_cursor: SyncCursor::new(last.to_string()),
            has_more,
        })
    }
}

#[async_trait]
impl Transport for MemoryServer {
    async fn push(
        &self,
        tenant: &TenantId,
        operations: &[Operation],
    ) -> TransportResult<Vec<OperationResult>> {
        self.delay().await;
        let mut state = self.state();
        if state.faults.offline {
            return Err(TransportError::Network("server unreachable".to_string()));
        }
        if state.faults.failing_pushes > 0 {
            state.faults.failing_pushes -= 1;
            return Err(TransportError::Network("connection reset".to_string()));
        }

        let results: Vec<OperationResult> = operations
            .iter()
            .map(|operation| OperationResult {
                operation_id: operation.operation_id,
                outcome: state.apply(tenant, operation),
            })
            .collect();

        if state.faults.lost_push_responses > 0 {
            state.faults.lost_push_responses -= 1;
            return Err(TransportError::Network("response lost".to_string()));
        }
        Ok(results)
    }

    async fn pull(
        &self,
        tenant: &TenantId,
        cursor: &SyncCursor,
        limit: usize,
    ) -> TransportResult<PullPage> {
        self.delay().await;
        let mut state = self.state();
        if state.faults.offline {
            return Err(TransportError::Network("server unreachable".to_string()));
        }
        state.faults.pull_calls += 1;
        let call = state.faults.pull_calls;
        if state.faults.failing_pulls.remove(&call) {
            return Err(TransportError::Network("connection reset".to_string()));
        }
        state.page(tenant, cursor, limit)
    }
}
