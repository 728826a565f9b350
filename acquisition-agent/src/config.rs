//! Configuration management
//!
//! Handles:
//! - Work-queue endpoint and worker pool limits
//! - Log sink address (and whether this process hosts it)
//! - Multicast discovery settings
//! - Time server settings
//! - Directory sync command
//!
//! Loaded from `$ACQUISITION_AGENT_CONFIG` when set, otherwise from the
//! OS-specific config directory. A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub const CONFIG_ENV: &str = "ACQUISITION_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub dispatcher: DispatcherConfig,
    pub log_sink: LogSinkConfig,
    pub discovery: DiscoveryConfig,
    pub time_sync: TimeSyncConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub bind: SocketAddr,
    pub temp_dir: PathBuf,
    pub max_workers: usize,
    pub worker_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    pub address: SocketAddr,
    /// Host the sink inside this process
    pub serve: bool,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    pub interface: Ipv4Addr,
    /// Shared secret expected in `test` queries; random per process when unset
    pub share_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub server: String,
    pub timeout_secs: u64,
    pub apply: bool,
    pub min_offset_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5555)),
            temp_dir: PathBuf::from("temp"),
            max_workers: 64,
            worker_timeout_secs: 600,
        }
    }
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 5556)),
            serve: true,
            log_file: PathBuf::from("acquisition-agent.log"),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: Ipv4Addr::new(224, 1, 1, 1),
            port: 5007,
            interface: Ipv4Addr::UNSPECIFIED,
            share_secret: None,
        }
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            server: "pool.ntp.org:123".to_string(),
            timeout_secs: 5,
            apply: false,
            min_offset_secs: 1.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 120,
        }
    }
}

impl AgentConfig {
    /// Load config from `$ACQUISITION_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("acquisition-agent");
        path.push("config.toml");
        Ok(path)
    }
}
