pub mod common;
pub mod completions;
pub mod dirty;
pub mod enqueue;
pub mod maintenance;
pub mod ops;
pub mod profile;
pub mod reviews;
pub mod show;
pub mod sync;
