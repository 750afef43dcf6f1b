use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Host hardware summary.
///
/// Detected at runtime using the `sysinfo` crate. Used by the `status`
/// command and to describe the fallback slot in degraded mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// Host name, if the OS reports one
    pub hostname: Option<String>,

    /// Number of logical CPU cores
    pub cpu_cores: usize,

    /// Total RAM in megabytes
    pub ram_mb: usize,

    /// Operating system
    pub os: String,

    /// CPU architecture
    pub arch: String,
}

impl HostCapabilities {
    /// Detect current host capabilities.
    ///
    /// # Example
    ///
    /// ```
    /// use fleet_agent::HostCapabilities;
    ///
    /// let host = HostCapabilities::detect();
    /// println!("{} cores, {} MB RAM", host.cpu_cores, host.ram_mb);
    /// ```
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_cores = sys.cpus().len();
        let ram_mb = (sys.total_memory() / 1_048_576) as usize; // bytes to MB

        Self {
            hostname: System::host_name(),
            cpu_cores,
            ram_mb,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_detection() {
        let caps = HostCapabilities::detect();

        assert!(caps.cpu_cores > 0, "CPU cores should be detected");
        assert!(caps.ram_mb > 0, "RAM should be detected");
        assert!(!caps.os.is_empty(), "OS should be detected");
        assert!(!caps.arch.is_empty(), "Architecture should be detected");
    }

    #[test]
    fn test_capabilities_serialization() {
        let caps = HostCapabilities {
            hostname: Some("rig-01".to_string()),
            cpu_cores: 8,
            ram_mb: 16384,
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
        };

        let json = serde_json::to_string(&caps).unwrap();
        let deserialized: HostCapabilities = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.hostname.as_deref(), Some("rig-01"));
        assert_eq!(deserialized.cpu_cores, caps.cpu_cores);
        assert_eq!(deserialized.ram_mb, caps.ram_mb);
    }
}
