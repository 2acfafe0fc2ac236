//! Error types for possync-core

use thiserror::Error;

use crate::models::OperationId;

/// Result type alias using possync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in possync-core storage and model operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or operation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation with the same id is already in the log
    #[error("Duplicate operation: {0}")]
    DuplicateOperation(OperationId),

    /// Operation status does not allow the requested transition
    #[error("Invalid operation transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    /// Whether the error indicates a damaged or unreadable database file.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            Self::Database(message) => message
                .to_ascii_lowercase()
                .contains("file is not a database"),
            _ => false,
        }
    }
}
