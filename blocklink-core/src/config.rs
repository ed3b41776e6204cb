//! Static configuration for the blocklink daemon
//!
//! Loaded once at startup and immutable afterwards. Located at
//! `~/.config/blocklink/config.toml` by default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Returns the default path for the static configuration file.
///
/// Uses the XDG config directory when available:
/// - Linux/macOS: `~/.config/blocklink/config.toml`
/// - Fallback: `/etc/blocklink/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("blocklink")
        .join("config.toml")
}

/// Returns the default user-data root.
///
/// Per-board project directories are created under this root, and the
/// extension-library directory lives beside it.
pub fn default_user_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("blocklink")
}

fn default_tools_dir() -> PathBuf {
    default_user_data_dir().join("tools")
}

fn default_discovery_interval_ms() -> u64 {
    100
}

fn default_health_interval_ms() -> u64 {
    10
}

fn default_subprocess_timeout_secs() -> u64 {
    120
}

/// Static configuration for a blocklink session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Root for per-board project directories (source staging)
    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,

    /// Root of the external toolchain (compilers, flashers, helper scripts)
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,

    /// Interval between discovery scans of the OS device list
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Interval between connection liveness probes
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Bounded wait for any single external tool invocation
    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            user_data_dir: default_user_data_dir(),
            tools_dir: default_tools_dir(),
            discovery_interval_ms: default_discovery_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            subprocess_timeout_secs: default_subprocess_timeout_secs(),
        }
    }
}

impl LinkConfig {
    /// Parse a `LinkConfig` from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Load from a TOML file; missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Per-board project directory, e.g. `<user data>/microbit/project`.
    pub fn project_dir(&self, family: &str) -> PathBuf {
        self.user_data_dir.join(family).join("project")
    }

    /// Optional extension-library directory beside the user-data root.
    ///
    /// Files found here are staged as additional upload payload.
    pub fn extension_library_dir(&self, family_title: &str) -> PathBuf {
        self.user_data_dir
            .parent()
            .unwrap_or(&self.user_data_dir)
            .join("extensions")
            .join("libraries")
            .join(family_title)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }
}
