//! Published sync state.

use serde::{Deserialize, Serialize};

/// Sync status observed by the application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    /// Waiting out the retry delay after `attempt` failed cycles in a row
    Backoff { attempt: u32 },
    Error { detail: String },
}

impl SyncStatus {
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Syncing => f.write_str("syncing"),
            Self::Backoff { attempt } => write!(f, "backoff (attempt {attempt})"),
            Self::Error { detail } => write!(f, "error: {detail}"),
        }
    }
}
