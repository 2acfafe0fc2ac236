//! Data models for possync

mod cursor;
mod operation;
mod record;
mod review;

pub use cursor::SyncCursor;
pub use operation::{Operation, OperationId, OperationKind, OperationStatus};
pub use record::{changed_fields, ActorId, DeviceId, FieldMap, Record, RecordKey, TenantId, Version};
pub use review::ManualReview;
