//! Manual review model for conflicts the resolver refuses to settle

use serde::{Deserialize, Serialize};

use super::operation::OperationId;
use super::record::{RecordKey, Version};

/// A field conflict recorded for manual review (e.g. two different cash amounts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReview {
    /// Review row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub key: RecordKey,
    /// Conflicting field
    pub field: String,
    /// Version the local change was based on
    pub local_version: Version,
    /// Server version that conflicted with it
    pub remote_version: Version,
    /// Value the local device tried to write
    pub local_value: Option<serde_json::Value>,
    /// Value held by the server
    pub remote_value: Option<serde_json::Value>,
    /// Local operation that carried the conflicting value, when known
    pub operation_id: Option<OperationId>,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (unix ms), `None` while open
    pub resolved_at: Option<i64>,
}

impl ManualReview {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
