//! Resolution reports

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{OperationId, RecordKey, Version};

/// Rule that settled one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Only one side changed the field
    AutoMerged,
    /// Both sides wrote the same value
    Converged,
    /// Later state in the declared status order
    StatusOrder,
    /// Version, then `updated_by`
    LastWriterWins,
    /// Kept the server value and queued the conflict for a person to decide
    ManualReview,
    /// A deletion on one side dominated
    Tombstone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
}

/// Outcome for a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field: String,
    pub strategy: Strategy,
    pub winner: Winner,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    /// Set for monetary conflicts and malformed values
    pub needs_review: bool,
}

/// Everything the resolver decided for one local change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub key: RecordKey,
    pub operation_id: Option<OperationId>,
    pub base_version: Version,
    pub remote_version: Version,
    pub merged_version: Version,
    pub fields: Vec<FieldResolution>,
}

impl ResolutionReport {
    /// Whether any field was left for manual review
    pub fn needs_review(&self) -> bool {
        self.fields.iter().any(|field| field.needs_review)
    }

    /// Fields queued for manual review
    pub fn review_items(&self) -> impl Iterator<Item = &FieldResolution> {
        self.fields.iter().filter(|field| field.needs_review)
    }

    /// Local status transitions that a later remote state overrode
    pub fn dominated_transitions(&self) -> impl Iterator<Item = &FieldResolution> {
        self.fields
            .iter()
            .filter(|field| {
                field.strategy == Strategy::StatusOrder && field.winner == Winner::Remote
            })
    }

    /// Local field values dropped by the resolution
    pub fn lost_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.winner == Winner::Remote && field.strategy != Strategy::Converged)
            .map(|field| field.field.as_str())
    }
}

impl std::fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} base {} remote {} -> {}",
            self.key, self.base_version, self.remote_version, self.merged_version
        )?;
        for field in &self.fields {
            write!(
                f,
                "; {}: {:?} ({:?}{})",
                field.field,
                field.strategy,
                field.winner,
                if field.needs_review { ", review" } else { "" }
            )?;
        }
        Ok(())
    }
}
