//! Request and result types for one device's unit of work

use crate::device::DeviceId;
use crate::errors::{AgentError, Result};
use crate::process::ProcessOutput;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of work addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub device_id: DeviceId,

    /// Iterations passed to the mining binary (must be >= 1)
    pub iterations: u64,

    pub timeout: Option<Duration>,
}

impl WorkRequest {
    pub fn new(device_id: DeviceId, iterations: u64) -> Self {
        Self {
            device_id,
            iterations,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject requests that must never reach the binary.
    pub fn validate(&self) -> Result<()> {
        validate_iterations(self.iterations)?;

        if self.timeout == Some(Duration::ZERO) {
            return Err(AgentError::InvalidArgument(
                "timeout must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn validate_iterations(iterations: u64) -> Result<()> {
    if iterations == 0 {
        return Err(AgentError::InvalidArgument(
            "iterations must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Why a unit of work did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The binary ran and exited nonzero
    NonZeroExit,
    LaunchFailure,
    Timeout,
    InvalidArgument,
    Cancelled,
    /// The worker task panicked before reporting
    WorkerPanicked,
    /// Anything else (e.g. waiting on the child failed)
    Internal,
}

impl FailureKind {
    pub fn of(error: &AgentError) -> Self {
        match error {
            AgentError::LaunchFailure { .. } => FailureKind::LaunchFailure,
            AgentError::Timeout { .. } => FailureKind::Timeout,
            AgentError::InvalidArgument(_) => FailureKind::InvalidArgument,
            AgentError::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one device's unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub device_id: DeviceId,
    pub iterations: u64,
    pub success: bool,

    /// Captured stdout, verbatim
    pub output: String,

    /// Captured stderr, verbatim
    pub error: String,

    /// Exit status of the binary; -1 when it never produced one
    pub exit_status: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    pub elapsed_ms: u64,

    #[serde(default)]
    pub truncated: bool,
}

impl WorkResult {
    /// Build a result from a child that ran to completion.
    pub fn from_output(request: &WorkRequest, out: ProcessOutput) -> Self {
        let success = out.success();
        let failure = (!success).then(|| FailureReason {
            kind: FailureKind::NonZeroExit,
            message: format!("exited with status {}", out.exit_status),
        });

        Self {
            device_id: request.device_id,
            iterations: request.iterations,
            success,
            output: out.output.stdout,
            error: out.output.stderr,
            exit_status: out.exit_status,
            failure,
            elapsed_ms: out.elapsed.as_millis() as u64,
            truncated: out.output.truncated,
        }
    }

    /// Fold a handle-level error into a failed result, keeping any partial output.
    pub fn from_error(request: &WorkRequest, error: &AgentError, elapsed: Duration) -> Self {
        let (output, stderr, truncated) = match error {
            AgentError::Timeout { partial, .. } | AgentError::Cancelled { partial } => (
                partial.stdout.clone(),
                partial.stderr.clone(),
                partial.truncated,
            ),
            _ => (String::new(), String::new(), false),
        };

        Self {
            device_id: request.device_id,
            iterations: request.iterations,
            success: false,
            output,
            error: stderr,
            exit_status: -1,
            failure: Some(FailureReason {
                kind: FailureKind::of(error),
                message: error.to_string(),
            }),
            elapsed_ms: elapsed.as_millis() as u64,
            truncated,
        }
    }

    /// Failed result for a worker task that never reported.
    pub fn panicked(request: &WorkRequest, message: impl Into<String>) -> Self {
        Self {
            device_id: request.device_id,
            iterations: request.iterations,
            success: false,
            output: String::new(),
            error: String::new(),
            exit_status: -1,
            failure: Some(FailureReason {
                kind: FailureKind::WorkerPanicked,
                message: message.into(),
            }),
            elapsed_ms: 0,
            truncated: false,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CapturedOutput;
    use std::path::PathBuf;

    fn output(exit_status: i32, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            exit_status,
            output: CapturedOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                truncated: false,
            },
            elapsed: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = WorkRequest::new(0, 0).validate().unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let request = WorkRequest::new(0, 10).with_timeout(Some(Duration::ZERO));
        assert!(request.validate().is_err());
        assert!(WorkRequest::new(0, 10).validate().is_ok());
    }

    #[test]
    fn test_from_output_success() {
        let request = WorkRequest::new(2, 1000);
        let result = WorkResult::from_output(&request, output(0, "found:0\n"));

        assert!(result.success);
        assert_eq!(result.device_id, 2);
        assert_eq!(result.iterations, 1000);
        assert_eq!(result.output, "found:0\n");
        assert_eq!(result.failure, None);
        assert_eq!(result.elapsed_ms, 42);
    }

    #[test]
    fn test_from_output_nonzero_exit() {
        let request = WorkRequest::new(1, 10);
        let result = WorkResult::from_output(&request, output(7, ""));

        assert!(!result.success);
        assert_eq!(result.exit_status, 7);
        assert_eq!(result.failure_kind(), Some(FailureKind::NonZeroExit));
    }

    #[test]
    fn test_from_timeout_keeps_partial_output() {
        let request = WorkRequest::new(1, 10);
        let err = AgentError::Timeout {
            timeout_ms: 500,
            partial: Box::new(CapturedOutput {
                stdout: "searching\n".into(),
                stderr: "warn\n".into(),
                truncated: false,
            }),
        };
        let result = WorkResult::from_error(&request, &err, Duration::from_millis(500));

        assert!(!result.success);
        assert_eq!(result.exit_status, -1);
        assert_eq!(result.output, "searching\n");
        assert_eq!(result.error, "warn\n");
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_from_launch_failure() {
        let request = WorkRequest::new(0, 10);
        let err = AgentError::LaunchFailure {
            binary: PathBuf::from("/missing"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let result = WorkResult::from_error(&request, &err, Duration::ZERO);

        assert_eq!(result.failure_kind(), Some(FailureKind::LaunchFailure));
        assert!(result.failure.unwrap().message.contains("/missing"));
    }

    #[test]
    fn test_result_json_shape() {
        let request = WorkRequest::new(0, 1000);
        let result = WorkResult::from_output(&request, output(0, "found:0"));
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["device_id"], 0);
        assert_eq!(json["success"], true);
        assert_eq!(json["output"], "found:0");
        assert!(json.get("failure").is_none());
    }
}
