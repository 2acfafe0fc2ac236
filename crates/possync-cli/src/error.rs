use std::io;

use possync_core::sync::TransportError;
use possync_core::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] possync_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid field assignment {0:?}, expected name=value")]
    InvalidField(String),
    #[error("Operation id is not valid: {0}")]
    InvalidOperationId(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No tenant configured. Pass --tenant, set POSSYNC_TENANT, \
         or store one with `possync profile set --tenant`."
    )]
    MissingTenant,
    #[error(
        "Sync is not configured. Pass --server-url, set POSSYNC_SERVER_URL, \
         or store one with `possync profile set --server-url`."
    )]
    SyncNotConfigured,
}
