//! possync-core - offline-first synchronization core
//!
//! Point-of-sale devices keep writing while disconnected. Local writes land in
//! the record store and a durable operation log; the sync client later pushes
//! them, pulls the server's changes since the device cursor, and settles
//! divergence field by field with the conflict resolver.

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{
    ActorId, DeviceId, FieldMap, ManualReview, Operation, OperationId, OperationKind,
    OperationStatus, Record, RecordKey, SyncCursor, TenantId, Version,
};
pub use scheduler::{SyncEvent, SyncScheduler};
pub use services::{GcReport, ReviewChoice, SyncStore};
pub use state::SyncStatus;
pub use sync::{CancelFlag, DeltaSyncClient, HttpTransport, MemoryServer, SyncError, SyncResult};
