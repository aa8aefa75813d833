//! Flat, `serde`-deserialized configuration, loaded once at startup and
//! read thereafter (§5 "Shared-state policy": process-wide read-mostly,
//! no lock required since writes cease before any worker is spawned).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bootimage::PatternConfig;
use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WritableMethod {
    Toggle,
    Copy,
}

impl std::str::FromStr for WritableMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "toggle" => Ok(Self::Toggle),
            "copy" => Ok(Self::Copy),
            other => Err(ConfigError::UnknownWritableMethod(other.to_string())),
        }
    }
}

/// The action taken for a snapshot whose external-kernel modules are stale.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleAction {
    Warn,
    Disable,
    Delete,
    Fallback,
}

impl StaleAction {
    /// Unrecognised action strings parse to a single safe default. See
    /// DESIGN.md "Open Question resolutions": `Warn`, because an
    /// unrecognised configuration value must never silently cause a
    /// boot entry to disappear.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "warn" => Self::Warn,
            "disable" => Self::Disable,
            "delete" => Self::Delete,
            "fallback" => Self::Fallback,
            other => {
                log::warn!("unrecognised kernel.stale_snapshot_action {other:?}, defaulting to warn");
                Self::Warn
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnapshotConfig {
    pub search_directories: Vec<PathBuf>,
    pub max_depth: usize,
    /// 0 means "all".
    pub selection_count: usize,
    pub destination_dir: PathBuf,
    pub writable_method: WritableMethod,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            search_directories: vec![PathBuf::from(".snapshots")],
            max_depth: 3,
            selection_count: 0,
            destination_dir: PathBuf::from(".snapshots/rw"),
            writable_method: WritableMethod::Toggle,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct BootManagerConfig {
    pub config_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BootPartitionConfig {
    pub auto_detect: bool,
    pub uuid: Option<String>,
    pub mount_point: Option<PathBuf>,
}

impl Default for BootPartitionConfig {
    fn default() -> Self {
        Self {
            auto_detect: true,
            uuid: None,
            mount_point: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BehaviorConfig {
    pub exit_on_snapshot_boot: bool,
    pub cleanup_old_snapshots: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            exit_on_snapshot_boot: true,
            cleanup_old_snapshots: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KernelConfig {
    pub boot_image_patterns: Vec<PatternConfig>,
    pub stale_snapshot_action: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            boot_image_patterns: PatternConfig::defaults(),
            stale_snapshot_action: "fallback".to_string(),
        }
    }
}

impl KernelConfig {
    pub fn stale_action(&self) -> StaleAction {
        StaleAction::parse_or_default(&self.stale_snapshot_action)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct DisplayConfig {
    pub local_time: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AdvancedConfig {
    pub naming_timestamp_format: String,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            naming_timestamp_format: "%Y-%m-%d_%H-%M-%S".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub snapshot: SnapshotConfig,
    pub boot_manager: BootManagerConfig,
    pub boot_partition: BootPartitionConfig,
    pub behavior: BehaviorConfig,
    pub kernel: KernelConfig,
    pub display: DisplayConfig,
    pub advanced: AdvancedConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Used when no `--config` path is given or the file doesn't exist;
    /// every field above already carries a sensible default.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }
}
