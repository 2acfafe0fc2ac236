//! Database layer for possync

mod connection;
mod cursor_store;
mod locks;
mod migrations;
mod operation_log;
mod record_store;
mod review_repository;

pub use connection::Database;
pub use cursor_store::{CursorStore, SqliteCursorStore};
pub use locks::EntityLocks;
pub use operation_log::{OperationLog, SqliteOperationLog};
pub use record_store::{PutOutcome, RecordStore, SqliteRecordStore};
pub use review_repository::{ReviewRepository, SqliteReviewRepository};
