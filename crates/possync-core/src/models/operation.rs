//! Operation model: one durable, idempotent intent to mutate a record

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{ActorId, FieldMap, RecordKey, Version};
use crate::error::Error;

/// Client-generated operation identifier, using UUID v7 (time-sortable).
///
/// The server deduplicates on this id, which makes push safely retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What an operation does to its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    StatusTransition,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::StatusTransition => "status_transition",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "status_transition" => Ok(Self::StatusTransition),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind {other:?}"))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an operation in the log.
///
/// `pending -> in_flight -> acknowledged`, with `failed -> pending` after a
/// backoff and `conflicted` once a corrected operation replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
    Conflicted,
}

impl OperationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }

    /// Whether moving from `self` to `next` follows the operation state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (
                    Self::InFlight,
                    Self::Acknowledged | Self::Failed | Self::Conflicted | Self::Pending
                )
                | (Self::Failed | Self::Conflicted, Self::Pending)
                | (Self::Pending, Self::Conflicted)
        )
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(Error::InvalidInput(format!(
                "unknown operation status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub key: RecordKey,
    pub kind: OperationKind,
    /// Field-level patch
    pub payload_delta: FieldMap,
    /// Version of the record this operation was computed against
    pub base_version: Version,
    /// Record payload at `base_version`; not sent to the server
    #[serde(skip)]
    pub base_snapshot: FieldMap,
    pub updated_by: ActorId,
    pub status: OperationStatus,
    pub retry_count: u32,
    /// Earliest time (unix ms) the operation may be pushed again
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Per-device ordering key; assigned by the log on enqueue when zero
    #[serde(skip)]
    pub seq: i64,
    /// Client-local creation time (unix ms), diagnostics only
    pub created_at: i64,
}

impl Operation {
    /// Build a pending operation against the given base.
    #[must_use]
    pub fn new(
        key: RecordKey,
        kind: OperationKind,
        payload_delta: FieldMap,
        base_version: Version,
        base_snapshot: FieldMap,
        updated_by: ActorId,
    ) -> Self {
        Self {
            operation_id: OperationId::new(),
            key,
            kind,
            payload_delta,
            base_version,
            base_snapshot,
            updated_by,
            status: OperationStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            seq: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build the replacement for a stale operation after conflict resolution.
    ///
    /// The replacement keeps the original's queue position so per-entity FIFO
    /// ordering survives the rewrite.
    #[must_use]
    pub fn corrected(
        &self,
        delta: FieldMap,
        base_version: Version,
        base_snapshot: FieldMap,
    ) -> Self {
        let mut corrected = Self::new(
            self.key.clone(),
            self.kind,
            delta,
            base_version,
            base_snapshot,
            self.updated_by.clone(),
        );
        corrected.seq = self.seq;
        corrected
    }

    /// Whether the operation is waiting out a retry backoff at `now_ms`
    #[must_use]
    pub fn is_backing_off(&self, now_ms: i64) -> bool {
        self.next_retry_at.is_some_and(|at| at > now_ms)
    }
}
