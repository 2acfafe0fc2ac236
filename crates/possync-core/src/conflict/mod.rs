//! Conflict detection and resolution

mod policy;
mod report;
mod resolver;

pub use policy::{EntityPolicy, FieldPolicy, PolicyRegistry, StatusOrder};
pub use report::{FieldResolution, ResolutionReport, Strategy, Winner};
pub use resolver::{resolve, strip_lost_fields, LocalChange, Residual, Resolution};
