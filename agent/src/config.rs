use crate::device::DeviceId;
use crate::errors::{AgentError, Result};
use crate::worker::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the mining binary lives relative to the working directory by default
pub const DEFAULT_BINARY_PATH: &str = "./src/release/cuda_ed25519_vanity";

pub const DEFAULT_ITERATIONS: u64 = 1000;

pub const DEFAULT_VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Main configuration for the fleet agent
///
/// Serialized as TOML at `~/.vanity-fleet/fleet.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub miner: MinerConfig,
    pub inventory: InventoryConfig,
    pub logging: LoggingConfig,
}

/// How the mining binary is invoked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    pub binary_path: PathBuf,

    /// Iterations per device per dispatch round
    pub iterations: u64,

    /// Per-device timeout; unset means no limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Variable used to pin each child to its own device
    pub visible_devices_env: String,

    /// SIGTERM to SIGKILL delay for timed out runs
    pub kill_grace_ms: u64,
}

/// Where the device count comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InventorySourceKind {
    NvidiaSmi,
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryConfig {
    pub source: InventorySourceKind,

    /// Slot count when `source = "static"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_count: Option<usize>,

    pub nvidia_smi_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,

    /// Defaults to `~/.vanity-fleet/logs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            miner: MinerConfig {
                binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
                iterations: DEFAULT_ITERATIONS,
                timeout_secs: None,
                visible_devices_env: DEFAULT_VISIBLE_DEVICES_ENV.to_string(),
                kill_grace_ms: 2000,
            },
            inventory: InventoryConfig {
                source: InventorySourceKind::NvidiaSmi,
                device_count: None,
                nvidia_smi_path: PathBuf::from("nvidia-smi"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: None,
            },
        }
    }
}

impl FleetConfig {
    /// Get default configuration file path: `~/.vanity-fleet/fleet.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| AgentError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".vanity-fleet").join("fleet.toml"))
    }

    /// Load the file at `path`, or defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: FleetConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.miner.iterations == 0 {
            return Err(AgentError::Config("miner.iterations must be at least 1".into()));
        }

        if self.miner.timeout_secs == Some(0) {
            return Err(AgentError::Config(
                "miner.timeout_secs must be at least 1 when set".into(),
            ));
        }

        if self.miner.binary_path.as_os_str().is_empty() {
            return Err(AgentError::Config("miner.binary_path must not be empty".into()));
        }

        let env = &self.miner.visible_devices_env;
        if env.is_empty() || env.contains('=') || env.contains('\0') {
            return Err(AgentError::Config(format!(
                "miner.visible_devices_env is not a valid variable name: {:?}",
                env
            )));
        }

        if self.inventory.source == InventorySourceKind::Static
            && self.inventory.device_count.is_none()
        {
            return Err(AgentError::Config(
                "inventory.device_count is required when source = \"static\"".into(),
            ));
        }

        if let Some(count) = self.inventory.device_count {
            if DeviceId::try_from(count).is_err() {
                return Err(AgentError::Config(format!(
                    "inventory.device_count {} exceeds the device id range",
                    count
                )));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(AgentError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.miner.timeout_secs.map(Duration::from_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            binary_path: self.miner.binary_path.clone(),
            visible_devices_env: self.miner.visible_devices_env.clone(),
            grace_period: Some(Duration::from_millis(self.miner.kill_grace_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();

        assert_eq!(config.miner.binary_path, PathBuf::from(DEFAULT_BINARY_PATH));
        assert_eq!(config.miner.iterations, 1000);
        assert_eq!(config.miner.visible_devices_env, "CUDA_VISIBLE_DEVICES");
        assert_eq!(config.inventory.source, InventorySourceKind::NvidiaSmi);
        assert!(!config.logging.log_to_file);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_iterations() {
        let mut config = FleetConfig::default();
        config.miner.iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timeout() {
        let mut config = FleetConfig::default();
        config.miner.timeout_secs = Some(0);
        assert!(config.validate().is_err());

        config.miner.timeout_secs = Some(30);
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_static_inventory_needs_count() {
        let mut config = FleetConfig::default();
        config.inventory.source = InventorySourceKind::Static;
        assert!(config.validate().is_err());

        config.inventory.device_count = Some(4);
        assert!(config.validate().is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_device_count_beyond_device_id_range() {
        let mut config = FleetConfig::default();
        config.inventory.source = InventorySourceKind::Static;
        config.inventory.device_count = Some(DeviceId::MAX as usize + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_env_name() {
        let mut config = FleetConfig::default();
        config.miner.visible_devices_env = "A=B".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FleetConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [miner]
            binary_path = "/opt/vanity/cuda_ed25519_vanity"
            iterations = 5000
            timeout_secs = 600
            visible_devices_env = "CUDA_VISIBLE_DEVICES"
            kill_grace_ms = 1000

            [inventory]
            source = "static"
            device_count = 8
            nvidia_smi_path = "nvidia-smi"

            [logging]
            level = "debug"
            log_to_file = true
        "#;

        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.miner.iterations, 5000);
        assert_eq!(config.inventory.source, InventorySourceKind::Static);
        assert_eq!(config.inventory.device_count, Some(8));
        assert_eq!(config.logging.log_dir, None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("fleet.toml");

        let mut original = FleetConfig::default();
        original.miner.timeout_secs = Some(120);
        original.save(&config_path).expect("save should succeed");

        assert!(config_path.exists());

        let loaded = FleetConfig::load(&config_path).expect("load should succeed");
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("fleet.toml");

        FleetConfig::default().save(&config_path).unwrap();

        let temp_path = config_path.with_extension("toml.tmp");
        assert!(config_path.exists());
        assert!(!temp_path.exists(), "Temp file should be cleaned up");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = FleetConfig::load_or_default(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, FleetConfig::default());
    }

    #[test]
    fn test_default_path() {
        let path = FleetConfig::default_path().unwrap();
        assert!(path.to_string_lossy().contains(".vanity-fleet"));
        assert!(path.to_string_lossy().ends_with("fleet.toml"));
    }

    #[test]
    fn test_worker_settings() {
        let settings = FleetConfig::default().worker_settings();
        assert_eq!(settings.binary_path, PathBuf::from(DEFAULT_BINARY_PATH));
        assert_eq!(settings.grace_period, Some(Duration::from_millis(2000)));
    }
}
