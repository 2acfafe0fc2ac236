//! Services layer for possync

mod store;

pub use store::{DirtyScan, GcReport, ReviewChoice, SyncStore};
pub(crate) use store::{PullApplied, PushApplied};
