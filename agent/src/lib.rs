//! Fleet agent: runs a vanity-key mining binary on every accelerator of a
//! host and folds the per-device outcomes into one summary.

pub mod aggregate;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod errors;
pub mod observability;
pub mod process;
pub mod runtime;
pub mod stats;
pub mod worker;

pub use aggregate::{aggregate, any_cancelled, RoundFlags, Summary};
pub use config::FleetConfig;
pub use device::{Device, DeviceId, DeviceKind, HostCapabilities, Inventory, InventorySource};
pub use dispatcher::Dispatcher;
pub use errors::{AgentError, Result};
pub use observability::{init_production_logging, init_simple_logging};
pub use process::{CapturedOutput, ProcessOutput, ProcessRunner, ProcessSpec};
pub use runtime::RuntimeContext;
pub use stats::DispatchStats;
pub use worker::{FailureKind, FailureReason, WorkRequest, WorkResult, WorkerHandle, WorkerSettings};
