//! Delta synchronization: transports, the sync client and its results.

mod backoff;
mod cancel;
mod client;
mod http;
mod memory;
mod transport;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::conflict::ResolutionReport;
use crate::error::Error;
use crate::models::{OperationId, RecordKey, SyncCursor, TenantId};

pub use backoff::Backoff;
pub use cancel::CancelFlag;
pub use client::DeltaSyncClient;
pub use http::HttpTransport;
pub use memory::MemoryServer;
pub use transport::{
    classify_http_status, OperationResult, PullPage, PushOutcome, RetryClass, Transport,
    TransportError, TransportResult,
};

/// Sync cycle phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Push,
    Pull,
    Apply,
    AdvanceCursor,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Apply => "apply",
            Self::AdvanceCursor => "cursor advance",
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{phase} failed: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: TransportError,
    },
    #[error("local storage failed: {0}")]
    Storage(#[from] Error),
    #[error("sync cancelled before {0}")]
    Cancelled(Phase),
    #[error("a sync cycle is already running for tenant {0}")]
    AlreadyRunning(TenantId),
}

impl SyncError {
    /// Whether a later cycle can succeed without intervention
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_transient(),
            Self::AlreadyRunning(_) | Self::Cancelled(_) => true,
            Self::Storage(_) => false,
        }
    }

    /// Local storage failures halt the scheduler until it is resumed
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Operation the server refused as invalid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedOperation {
    pub operation_id: OperationId,
    pub key: RecordKey,
    pub reason: String,
}

/// Summary of one completed sync cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub tenant: TenantId,
    /// Operations acknowledged by the server
    pub pushed: usize,
    pub rejected: Vec<RejectedOperation>,
    /// Operations the server left unanswered; retried after backoff
    pub deferred: usize,
    pub pulled: usize,
    pub applied: usize,
    /// Pulled records dropped as older than, or shadowed by, the local copy
    pub skipped: usize,
    pub conflicts: usize,
    pub reviews_queued: usize,
    pub reports: Vec<ResolutionReport>,
    pub pull_pages: usize,
    pub cursor: SyncCursor,
    /// The push round limit was reached with operations still queued
    pub more_pending: bool,
    pub duration: Duration,
}

impl SyncResult {
    fn new(tenant: &TenantId, cursor: SyncCursor) -> Self {
        Self {
            tenant: tenant.clone(),
            pushed: 0,
            rejected: Vec::new(),
            deferred: 0,
            pulled: 0,
            applied: 0,
            skipped: 0,
            conflicts: 0,
            reviews_queued: 0,
            reports: Vec::new(),
            pull_pages: 0,
            cursor,
            more_pending: false,
            duration: Duration::ZERO,
        }
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed {}, rejected {}, deferred {}, pulled {} in {} pages, applied {}, \
             conflicts {}, reviews {} ({} ms)",
            self.pushed,
            self.rejected.len(),
            self.deferred,
            self.pulled,
            self.pull_pages,
            self.applied,
            self.conflicts,
            self.reviews_queued,
            self.duration.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let transient = SyncError::Transport {
            phase: Phase::Pull,
            source: TransportError::Timeout,
        };
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());
        assert_eq!(transient.to_string(), "pull failed: request timed out");

        let unauthorized = SyncError::Transport {
            phase: Phase::Push,
            source: TransportError::Unauthorized("expired".into()),
        };
        assert!(!unauthorized.is_transient());

        let storage = SyncError::Storage(Error::Database("disk full".into()));
        assert!(storage.is_fatal());
        assert!(!storage.is_transient());
    }
}
