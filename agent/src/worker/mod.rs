//! Per-device workers
//!
//! A [`WorkerHandle`] owns one device and runs the mining binary against it,
//! one invocation at a time.

mod handle;
pub mod types;

pub use handle::{WorkerHandle, WorkerSettings};
pub use types::{FailureKind, FailureReason, WorkRequest, WorkResult};
