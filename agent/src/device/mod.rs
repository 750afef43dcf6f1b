//! Accelerator device inventory
//!
//! A [`Device`] is one execution slot that can run exactly one mining
//! invocation at a time. Devices are enumerated once per dispatcher through
//! an [`InventorySource`]; when no accelerator is found the dispatcher falls
//! back to a single logical slot (degraded mode).

mod capabilities;

pub use capabilities::HostCapabilities;

use crate::errors::{AgentError, Result};
use crate::process::{ProcessRunner, ProcessSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, instrument};

/// Identifier of a device, as passed to the mining binary.
pub type DeviceId = u32;

/// How long `nvidia-smi` may take before the query counts as failed.
const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// A physical accelerator
    Gpu,

    /// The single fallback slot used when no accelerator is available
    Logical,
}

/// One accelerator execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
}

impl Device {
    pub fn gpu(id: DeviceId) -> Self {
        Self {
            id,
            kind: DeviceKind::Gpu,
        }
    }

    pub fn logical() -> Self {
        Self {
            id: 0,
            kind: DeviceKind::Logical,
        }
    }

    /// Value for the visible-devices variable of a child bound to this device.
    ///
    /// A logical slot exposes no accelerator at all.
    pub fn visible_devices(&self) -> String {
        match self.kind {
            DeviceKind::Gpu => self.id.to_string(),
            DeviceKind::Logical => String::new(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Gpu => write!(f, "GPU {}", self.id),
            DeviceKind::Logical => write!(f, "logical slot {}", self.id),
        }
    }
}

/// Result of one enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Devices in ascending id order
    pub devices: Vec<Device>,

    /// True when no accelerator was found and a logical slot was substituted
    pub degraded: bool,
}

impl Inventory {
    /// Build an inventory of `count` GPUs, or a degraded one if `count` is zero.
    ///
    /// # Errors
    /// `AgentError::Inventory` if `count` does not fit a [`DeviceId`].
    pub fn from_count(count: usize) -> Result<Self> {
        if count == 0 {
            return Ok(Self::degraded());
        }

        let count = DeviceId::try_from(count).map_err(|_| {
            AgentError::Inventory(format!("{} devices exceeds the device id range", count))
        })?;

        Ok(Self {
            devices: (0..count).map(Device::gpu).collect(),
            degraded: false,
        })
    }

    pub fn degraded() -> Self {
        Self {
            devices: vec![Device::logical()],
            degraded: true,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Supplies the number of accelerator slots available on this host.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Count available slots. Zero is a valid answer.
    async fn available_slots(&self) -> Result<usize>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// A fixed slot count, e.g. from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticInventory {
    count: usize,
}

impl StaticInventory {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn available_slots(&self) -> Result<usize> {
        Ok(self.count)
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Counts GPUs reported by `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiInventory {
    program: PathBuf,
    runner: ProcessRunner,
}

impl NvidiaSmiInventory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            runner: ProcessRunner::new(),
        }
    }
}

#[async_trait]
impl InventorySource for NvidiaSmiInventory {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn available_slots(&self) -> Result<usize> {
        let spec = ProcessSpec::new(&self.program)
            .arg("--query-gpu=index")
            .arg("--format=csv,noheader")
            .timeout(Some(NVIDIA_SMI_TIMEOUT));

        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| AgentError::Inventory(format!("nvidia-smi failed: {}", e)))?;

        if !out.success() {
            return Err(AgentError::Inventory(format!(
                "nvidia-smi exited with status {}: {}",
                out.exit_status,
                out.output.stderr.trim()
            )));
        }

        let count = parse_gpu_indices(&out.output.stdout)?;
        debug!(count, "nvidia-smi reported GPUs");
        Ok(count)
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

/// Parse `nvidia-smi --query-gpu=index --format=csv,noheader` output.
fn parse_gpu_indices(stdout: &str) -> Result<usize> {
    let mut count = 0;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        line.parse::<DeviceId>().map_err(|_| {
            AgentError::Inventory(format!("Unexpected nvidia-smi output line: {:?}", line))
        })?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_from_count() {
        let inventory = Inventory::from_count(4).unwrap();
        assert!(!inventory.degraded);
        assert_eq!(inventory.len(), 4);
        assert_eq!(
            inventory.devices.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(inventory.devices.iter().all(|d| d.kind == DeviceKind::Gpu));
    }

    #[test]
    fn test_zero_devices_degrades_to_one_logical_slot() {
        let inventory = Inventory::from_count(0).unwrap();
        assert!(inventory.degraded);
        assert_eq!(inventory.devices, vec![Device::logical()]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_count_beyond_device_id_range_is_rejected() {
        let err = Inventory::from_count(DeviceId::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, AgentError::Inventory(_)));
    }

    #[test]
    fn test_visible_devices() {
        assert_eq!(Device::gpu(3).visible_devices(), "3");
        assert_eq!(Device::logical().visible_devices(), "");
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::gpu(2).to_string(), "GPU 2");
        assert_eq!(Device::logical().to_string(), "logical slot 0");
    }

    #[test]
    fn test_parse_gpu_indices() {
        assert_eq!(parse_gpu_indices("0\n1\n2\n").unwrap(), 3);
        assert_eq!(parse_gpu_indices("").unwrap(), 0);
        assert_eq!(parse_gpu_indices("  0  \n\n 1\n").unwrap(), 2);
        assert!(parse_gpu_indices("No devices were found\n").is_err());
    }

    #[test]
    fn test_device_kind_serialization() {
        let json = serde_json::to_string(&DeviceKind::Logical).unwrap();
        assert_eq!(json, "\"logical\"");
    }

    #[tokio::test]
    async fn test_static_inventory() {
        let source = StaticInventory::new(2);
        assert_eq!(source.available_slots().await.unwrap(), 2);
        assert_eq!(source.name(), "static");
    }

    #[tokio::test]
    async fn test_missing_nvidia_smi_is_inventory_error() {
        let source = NvidiaSmiInventory::new("/definitely/not/nvidia-smi");
        let err = source.available_slots().await.unwrap_err();
        assert!(matches!(err, AgentError::Inventory(_)));
    }
}
