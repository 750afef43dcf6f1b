use crate::process::CapturedOutput;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the fleet agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Malformed request (non-positive iteration count, bad device id, etc.)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The mining binary could not be started at all
    #[error("Failed to launch {}: {source}", binary.display())]
    LaunchFailure {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The mining binary exceeded its allotted time and was terminated
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        partial: Box<CapturedOutput>,
    },

    /// The invocation was cancelled before the binary exited
    #[error("Cancelled before completion")]
    Cancelled { partial: Box<CapturedOutput> },

    /// The execution context is not initialized or was already shut down
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The device inventory could not be queried
    #[error("Inventory query failed: {0}")]
    Inventory(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred (file operations, pipes, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<toml::ser::Error> for AgentError {
    fn from(e: toml::ser::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(e: toml::de::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::InvalidArgument("iterations must be >= 1".to_string());
        assert_eq!(err.to_string(), "Invalid argument: iterations must be >= 1");
    }

    #[test]
    fn test_launch_failure_display() {
        let err = AgentError::LaunchFailure {
            binary: PathBuf::from("/opt/miner"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/opt/miner"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let agent_err: AgentError = io_err.into();
        assert!(agent_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_timeout_display() {
        let err = AgentError::Timeout {
            timeout_ms: 1500,
            partial: Box::default(),
        };
        assert_eq!(err.to_string(), "Timed out after 1500ms");
    }
}
