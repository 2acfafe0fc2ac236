//! Transport seam between the sync client and the server

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    ActorId, FieldMap, Operation, OperationId, Record, RecordKey, SyncCursor, TenantId, Version,
};

/// Retry policy classification for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify an HTTP status into retry behavior.
pub const fn classify_http_status(status: u16) -> RetryClass {
    match status {
        401 | 403 => RetryClass::ReauthRequired,
        408 | 423 | 425 | 429 | 500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
    #[error("invalid transport configuration: {0}")]
    InvalidConfiguration(String),
}

impl TransportError {
    /// Whether retrying the same request later can succeed
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { status, .. } => {
                matches!(classify_http_status(*status), RetryClass::Retryable)
            }
            Self::Unauthorized(_) | Self::InvalidResponse(_) | Self::InvalidConfiguration(_) => {
                false
            }
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Server verdict for one pushed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PushOutcome {
    Accepted {
        version: Version,
    },
    /// The record moved past the operation's base; carries the current server copy
    RejectedStale {
        version: Version,
        payload: FieldMap,
        #[serde(default)]
        deleted: bool,
        #[serde(default)]
        updated_by: Option<ActorId>,
    },
    RejectedInvalid {
        reason: String,
    },
}

impl PushOutcome {
    /// Server copy carried by a stale rejection, rebuilt as a record for `key`
    pub fn stale_record(&self, key: &RecordKey) -> Option<Record> {
        match self {
            Self::RejectedStale {
                version,
                payload,
                deleted,
                updated_by,
            } => {
                let updated_by = updated_by
                    .clone()
                    .unwrap_or_else(|| ActorId::from_storage(String::new()));
                let mut record = Record::new(key.clone(), *version, updated_by, payload.clone());
                record.deleted = *deleted;
                Some(record)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: OperationId,
    #[serde(flatten)]
    pub outcome: PushOutcome,
}

/// One page of server changes after a cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    pub records: Vec<Record>,
    pub next_cursor: SyncCursor,
    pub has_more: bool,
}

/// Server access used by the sync client.
///
/// Both calls must be safe to retry: the server deduplicates pushes on
/// `operation_id` and pulls are read-only.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(
        &self,
        tenant: &TenantId,
        operations: &[Operation],
    ) -> TransportResult<Vec<OperationResult>>;

    async fn pull(
        &self,
        tenant: &TenantId,
        cursor: &SyncCursor,
        limit: usize,
    ) -> TransportResult<PullPage>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn push(
        &self,
        tenant: &TenantId,
        operations: &[Operation],
    ) -> TransportResult<Vec<OperationResult>> {
        (**self).push(tenant, operations).await
    }

    async fn pull(
        &self,
        tenant: &TenantId,
        cursor: &SyncCursor,
        limit: usize,
    ) -> TransportResult<PullPage> {
        (**self).pull(tenant, cursor, limit).await
    }
}
