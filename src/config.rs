// Configuration for the mdev recovery controller
//
// Loaded from a JSON file; every field has a default so a missing file or a
// partial file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::host::HostPaths;
use crate::error::{MdevError, Result};
use crate::gpu::inventory::is_valid_pci_address;

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "MDEV_RECOVER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/mdev-recover/config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Explicit target devices; empty means every NVIDIA device
    pub devices: Vec<String>,
    pub module_settle_ms: u64,
    pub rescan_settle_ms: u64,
    pub service_poll_delay_ms: u64,
    pub verify_settle_ms: u64,
    /// Restart order matters: the manager depends on the daemon
    pub services: Vec<String>,
    pub fault_signature: String,
    pub wait_for_mdev_bus: bool,
    pub wait_trials: u32,
    pub wait_delay_ms: u64,
    pub paths: HostPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            devices: Vec::new(),
            module_settle_ms: 2_000,
            rescan_settle_ms: 5_000,
            service_poll_delay_ms: 3_000,
            verify_settle_ms: 10_000,
            services: vec!["nvidia-vgpud".to_string(), "nvidia-vgpu-mgr".to_string()],
            fault_signature: "RmInitAdapter failed".to_string(),
            wait_for_mdev_bus: false,
            wait_trials: 3,
            wait_delay_ms: 1_000,
            paths: HostPaths::default(),
        }
    }
}

impl Config {
    /// Location of the configuration file
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| MdevError::io(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| MdevError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.verify_settle_ms <= self.service_poll_delay_ms {
            return Err(MdevError::config(format!(
                "verify_settle_ms ({}) must be longer than service_poll_delay_ms ({})",
                self.verify_settle_ms, self.service_poll_delay_ms
            )));
        }
        if self.services.is_empty() {
            return Err(MdevError::config("at least one service must be configured"));
        }
        if self.fault_signature.trim().is_empty() {
            return Err(MdevError::config("fault_signature must not be empty"));
        }
        if let Some(bad) = self.devices.iter().find(|a| !is_valid_pci_address(a)) {
            return Err(MdevError::InvalidAddress { address: bad.clone() });
        }
        Ok(())
    }

    pub fn service_poll_delay(&self) -> Duration {
        Duration::from_millis(self.service_poll_delay_ms)
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_millis(self.wait_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.services, vec!["nvidia-vgpud", "nvidia-vgpu-mgr"]);
        assert_eq!(config.paths.mdev_bus, PathBuf::from("/sys/class/mdev_bus"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json(r#"{"devices": ["0000:01:00.0"], "verify_settle_ms": 20000}"#)
            .unwrap();
        assert_eq!(config.devices, vec!["0000:01:00.0"]);
        assert_eq!(config.verify_settle_ms, 20_000);
        assert_eq!(config.module_settle_ms, 2_000);
    }

    #[test]
    fn test_rejects_verify_not_longer_than_poll() {
        let err = Config::from_json(r#"{"service_poll_delay_ms": 5000, "verify_settle_ms": 5000}"#)
            .unwrap_err();
        assert!(matches!(err, MdevError::Config { .. }));
    }

    #[test]
    fn test_rejects_bad_address() {
        let err = Config::from_json(r#"{"devices": ["01:00.0"]}"#).unwrap_err();
        assert!(matches!(err, MdevError::InvalidAddress { .. }));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_from(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"log_level": "debug", "wait_for_mdev_bus": true}"#).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.wait_for_mdev_bus);
    }
}
