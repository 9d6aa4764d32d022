//! Configuration management for fleetd.
//!
//! Loads settings from /etc/fleetd/config.toml or uses defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/fleetd/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/fleetd/config.toml";

/// Daemon behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between ensure passes when nothing asks for an earlier one
    #[serde(default = "default_ensure_interval")]
    pub ensure_interval_secs: u64,

    /// Classic (non-appliance) system
    #[serde(default)]
    pub classic: bool,

    /// System boots through recovery/run modes (always true off classic)
    #[serde(default = "default_true")]
    pub has_modes: bool,

    /// Mode the system booted into
    #[serde(default = "default_system_mode")]
    pub system_mode: String,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_ensure_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_system_mode() -> String {
    "run".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ensure_interval_secs: default_ensure_interval(),
            classic: false,
            has_modes: default_true(),
            system_mode: default_system_mode(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Classic without recovery/run modes: no managed boot assets.
    pub fn is_plain_classic(&self) -> bool {
        self.classic && !self.has_modes
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State checkpoint file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Where snap revisions are mounted: `<snap_mount_dir>/<name>/<revision>`
    #[serde(default = "default_snap_mount_dir")]
    pub snap_mount_dir: PathBuf,

    /// Parent of per-update gadget rollback directories
    #[serde(default = "default_rollback_dir")]
    pub rollback_dir: PathBuf,

    /// Boot environment directory (modeenv, recovery systems)
    #[serde(default = "default_boot_dir")]
    pub boot_dir: PathBuf,

    /// Mount point of the boot partition written by gadget updates
    #[serde(default = "default_boot_assets_dir")]
    pub boot_assets_dir: PathBuf,

    /// Device key pairs, one file per key
    #[serde(default = "default_device_keys_dir")]
    pub device_keys_dir: PathBuf,

    /// Kernel boot id, changes on every boot
    #[serde(default = "default_boot_id_file")]
    pub boot_id_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/fleetd/state.json")
}

fn default_snap_mount_dir() -> PathBuf {
    PathBuf::from("/snap")
}

fn default_rollback_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetd/gadget/rollback")
}

fn default_boot_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetd/boot")
}

fn default_boot_assets_dir() -> PathBuf {
    PathBuf::from("/run/mnt/ubuntu-boot")
}

fn default_device_keys_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetd/device/private-keys-v1")
}

fn default_boot_id_file() -> PathBuf {
    PathBuf::from("/proc/sys/kernel/random/boot_id")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            snap_mount_dir: default_snap_mount_dir(),
            rollback_dir: default_rollback_dir(),
            boot_dir: default_boot_dir(),
            boot_assets_dir: default_boot_assets_dir(),
            device_keys_dir: default_device_keys_dir(),
            boot_id_file: default_boot_id_file(),
        }
    }
}

/// Registration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Stop after key generation on the first attempt until resumed
    #[serde(default)]
    pub pause_first_attempt: bool,

    /// Brand of the fallback model for seeded systems without one
    #[serde(default = "default_fallback_brand")]
    pub fallback_brand: String,

    /// Fallback model name
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    /// Seconds between polls while the serial is being issued
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds before retrying after a transient service failure
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Transient failures tolerated before the request task fails
    #[serde(default = "default_max_tentatives")]
    pub max_tentatives: u32,
}

fn default_fallback_brand() -> String {
    "generic".to_string()
}

fn default_fallback_model() -> String {
    "generic-classic".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    300
}

fn default_max_tentatives() -> u32 {
    5
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            pause_first_attempt: false,
            fallback_brand: default_fallback_brand(),
            fallback_model: default_fallback_model(),
            poll_interval_secs: default_poll_interval(),
            retry_interval_secs: default_retry_interval(),
            max_tentatives: default_max_tentatives(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,
}

impl Config {
    /// Load config from file, or return defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Defaults with every path moved under `root`.
    pub fn with_root(root: &Path) -> Self {
        let mut config = Config::default();
        config.paths = PathsConfig {
            state_file: root.join("var/lib/fleetd/state.json"),
            snap_mount_dir: root.join("snap"),
            rollback_dir: root.join("var/lib/fleetd/gadget/rollback"),
            boot_dir: root.join("var/lib/fleetd/boot"),
            boot_assets_dir: root.join("run/mnt/ubuntu-boot"),
            device_keys_dir: root.join("var/lib/fleetd/device/private-keys-v1"),
            boot_id_file: root.join("proc/sys/kernel/random/boot_id"),
        };
        config
    }
}
