use crate::config::{DEFAULT_BINARY_PATH, DEFAULT_VISIBLE_DEVICES_ENV};
use crate::device::{Device, DeviceId};
use crate::errors::{AgentError, Result};
use crate::process::{ProcessRunner, ProcessSpec};
use crate::worker::types::{WorkRequest, WorkResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How every worker invokes the mining binary.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub binary_path: PathBuf,

    /// Variable that restricts the child to its own device
    pub visible_devices_env: String,

    /// SIGTERM to SIGKILL delay when a run is timed out or cancelled
    pub grace_period: Option<Duration>,
}

impl WorkerSettings {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            ..Self::default()
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            visible_devices_env: DEFAULT_VISIBLE_DEVICES_ENV.to_string(),
            grace_period: None,
        }
    }
}

/// Execution slot bound to exactly one device.
///
/// Runs `<binary> <device_id> <iterations>` with the visible-devices variable
/// set on the child only. Invocations on one handle never overlap.
pub struct WorkerHandle {
    device: Device,
    binary: PathBuf,
    visible_devices_env: String,
    runner: ProcessRunner,
    claim: Mutex<()>,
}

impl WorkerHandle {
    pub fn new(device: Device, settings: &WorkerSettings) -> Self {
        let runner = match settings.grace_period {
            Some(grace) => ProcessRunner::new().with_grace_period(grace),
            None => ProcessRunner::new(),
        };

        Self {
            device,
            binary: settings.binary_path.clone(),
            visible_devices_env: settings.visible_devices_env.clone(),
            runner,
            claim: Mutex::new(()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.id
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the binary once with `iterations` and no timeout.
    ///
    /// A nonzero exit is reported in the returned [`WorkResult`], not as an error.
    ///
    /// # Errors
    /// * `AgentError::InvalidArgument` - `iterations` is zero; nothing is launched
    /// * `AgentError::LaunchFailure` - the binary could not be started
    pub async fn execute(&self, iterations: u64) -> Result<WorkResult> {
        let request = WorkRequest::new(self.device.id, iterations);
        self.run(&request, &CancellationToken::new()).await
    }

    /// Run the binary for `request`, honouring its timeout and `cancel`.
    #[instrument(skip(self, request, cancel), fields(device = %self.device, iterations = request.iterations))]
    pub async fn run(
        &self,
        request: &WorkRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkResult> {
        request.validate()?;

        if request.device_id != self.device.id {
            return Err(AgentError::InvalidArgument(format!(
                "request for device {} sent to worker for device {}",
                request.device_id, self.device.id
            )));
        }

        let _claim = self.claim.lock().await;

        let spec = ProcessSpec::new(&self.binary)
            .arg(self.device.id)
            .arg(request.iterations)
            .env(&self.visible_devices_env, self.device.visible_devices())
            .timeout(request.timeout);

        debug!(binary = %self.binary.display(), "Launching mining binary");

        let out = self.runner.run_until(&spec, cancel).await?;
        let result = WorkResult::from_output(request, out);

        if result.success {
            info!(elapsed_ms = result.elapsed_ms, "Mining run succeeded");
        } else {
            warn!(
                exit_status = result.exit_status,
                elapsed_ms = result.elapsed_ms,
                "Mining run exited with failure status"
            );
        }

        Ok(result)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("device", &self.device)
            .field("binary", &self.binary)
            .finish()
    }
}
