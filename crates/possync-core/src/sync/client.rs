//! Delta sync client: push, pull, apply, advance cursor.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::cancel::CancelFlag;
use super::transport::{PushOutcome, Transport, TransportError, TransportResult};
use super::{Phase, RejectedOperation, SyncError, SyncResult};
use crate::models::{DeviceId, OperationId, Record, SyncCursor, TenantId};
use crate::services::{PullApplied, PushApplied, SyncStore};
use crate::util::now_ms;

/// Runs sync cycles for one device.
///
/// At most one cycle runs per tenant; a concurrent call for the same tenant
/// fails fast with [`SyncError::AlreadyRunning`].
pub struct DeltaSyncClient {
    store: Arc<SyncStore>,
    transport: Arc<dyn Transport>,
    device: DeviceId,
    running: Arc<Mutex<HashSet<TenantId>>>,
}

struct RunningGuard {
    running: Arc<Mutex<HashSet<TenantId>>>,
    tenant: TenantId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tenant);
    }
}

impl DeltaSyncClient {
    pub fn new(store: Arc<SyncStore>, transport: Arc<dyn Transport>, device: DeviceId) -> Self {
        Self {
            store,
            transport,
            device,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub const fn device(&self) -> &DeviceId {
        &self.device
    }

    fn claim(&self, tenant: &TenantId) -> Result<RunningGuard, SyncError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(tenant.clone()) {
            return Err(SyncError::AlreadyRunning(tenant.clone()));
        }
        Ok(RunningGuard {
            running: Arc::clone(&self.running),
            tenant: tenant.clone(),
        })
    }

    /// Run one full cycle for `tenant`.
    ///
    /// `cancel` is checked between phases; a cancelled cycle leaves the
    /// cursor where it was.
    pub async fn run_sync_cycle(
        &self,
        tenant: &TenantId,
        cancel: &CancelFlag,
    ) -> Result<SyncResult, SyncError> {
        let _guard = self.claim(tenant)?;
        let started = Instant::now();

        let recovered = self.store.recover_in_flight(Some(tenant))?;
        if recovered > 0 {
            tracing::warn!("Recovered {recovered} in-flight operations for {tenant}");
        }
        let cursor = self.store.cursor(tenant, &self.device)?;
        let mut result = SyncResult::new(tenant, cursor.clone());

        checkpoint(cancel, Phase::Push)?;
        self.push_phase(tenant, &mut result).await?;

        checkpoint(cancel, Phase::Pull)?;
        let next_cursor = self.pull_phase(tenant, cursor, cancel, &mut result).await?;

        checkpoint(cancel, Phase::AdvanceCursor)?;
        if next_cursor != result.cursor {
            self.store.advance_cursor(tenant, &self.device, &next_cursor)?;
            result.cursor = next_cursor;
        }

        result.duration = started.elapsed();
        tracing::info!("Sync cycle for {tenant} complete: {result}");
        Ok(result)
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = TransportResult<T>>,
    ) -> TransportResult<T> {
        tokio::time::timeout(self.store.config().transport_timeout(), request)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn push_phase(
        &self,
        tenant: &TenantId,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let max_rounds = self.store.config().max_push_rounds;
        for round in 1..=max_rounds {
            let batch = self.store.take_push_batch(tenant, now_ms())?;
            if batch.is_empty() {
                return Ok(());
            }
            tracing::debug!("Push round {round}: {} operations", batch.len());

            let results = match self.call(self.transport.push(tenant, &batch)).await {
                Ok(results) => results,
                Err(source) => {
                    self.store.retry_later(&batch, &source.to_string(), now_ms())?;
                    return Err(SyncError::Transport {
                        phase: Phase::Push,
                        source,
                    });
                }
            };

            let mut outcomes: HashMap<OperationId, PushOutcome> = results
                .into_iter()
                .map(|result| (result.operation_id, result.outcome))
                .collect();

            let mut unanswered = Vec::new();
            for operation in &batch {
                let Some(outcome) = outcomes.remove(&operation.operation_id) else {
                    unanswered.push(operation.clone());
                    continue;
                };
                match self.store.apply_push_outcome(operation, &outcome)? {
                    PushApplied::Acknowledged { .. } => result.pushed += 1,
                    PushApplied::Resolved(reconciliation) => {
                        result.conflicts += 1;
                        result.reviews_queued += reconciliation.reviews_queued;
                        result.reports.push(reconciliation.report);
                    }
                    PushApplied::Rejected { reason } => result.rejected.push(RejectedOperation {
                        operation_id: operation.operation_id,
                        key: operation.key.clone(),
                        reason,
                    }),
                    PushApplied::Skipped => {}
                }
            }

            if !unanswered.is_empty() {
                tracing::warn!(
                    "Server returned no result for {} operations",
                    unanswered.len()
                );
                self.store
                    .retry_later(&unanswered, "no result from server", now_ms())?;
                result.deferred += unanswered.len();
            }
        }

        result.more_pending = true;
        tracing::debug!("Push round limit ({max_rounds}) reached for {tenant}");
        Ok(())
    }

    /// Pull every page since `cursor`, applying each page as it arrives.
    ///
    /// Returns the cursor after the last page. Nothing here persists the
    /// cursor; a failure on any page leaves the stored cursor where it was and
    /// the next cycle re-pulls pages that were already applied.
    async fn pull_phase(
        &self,
        tenant: &TenantId,
        mut cursor: SyncCursor,
        cancel: &CancelFlag,
        result: &mut SyncResult,
    ) -> Result<SyncCursor, SyncError> {
        let page_size = self.store.config().page_size;
        let pull_error = |source| SyncError::Transport {
            phase: Phase::Pull,
            source,
        };

        loop {
            let page = self
                .call(self.transport.pull(tenant, &cursor, page_size))
                .await
                .map_err(pull_error)?;
            result.pull_pages += 1;

            let stalled = page.next_cursor == cursor;
            let records: Vec<Record> = page
                .records
                .into_iter()
                .filter(|record| {
                    let ours = &record.key.tenant_id == tenant;
                    if !ours {
                        tracing::warn!(
                            "Ignoring pulled record {} from another tenant",
                            record.key
                        );
                    }
                    ours
                })
                .collect();
            result.pulled += records.len();

            checkpoint(cancel, Phase::Apply)?;
            self.apply_page(records, result)?;
            cursor = page.next_cursor;

            if !page.has_more {
                break;
            }
            if stalled {
                return Err(pull_error(TransportError::InvalidResponse(format!(
                    "cursor {cursor} did not advance"
                ))));
            }
        }

        tracing::debug!(
            "Pulled {} records in {} pages",
            result.pulled,
            result.pull_pages
        );
        Ok(cursor)
    }

    fn apply_page(&self, records: Vec<Record>, result: &mut SyncResult) -> Result<(), SyncError> {
        for record in records {
            match self.store.apply_pulled(record)? {
                PullApplied::Written => result.applied += 1,
                PullApplied::Dropped | PullApplied::Skipped => result.skipped += 1,
                PullApplied::Merged(reconciliation) => {
                    result.applied += 1;
                    result.conflicts += 1;
                    result.reviews_queued += reconciliation.reviews_queued;
                    result.reports.push(reconciliation.report);
                }
            }
        }
        Ok(())
    }
}

fn checkpoint(cancel: &CancelFlag, next: Phase) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        tracing::info!("Sync cancelled before {next}");
        return Err(SyncError::Cancelled(next));
    }
    Ok(())
}
