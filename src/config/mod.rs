//! Configuration module
//!
//! Handles loading and saving workmesh configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::network::NetworkConfig as NetSettings;
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};
use crate::transport::Selector;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Cluster membership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Local engine sizing
    #[serde(default)]
    pub engine: EngineSection,

    /// Work placement
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Node identifier (auto-generated if not set)
    pub node_id: Option<String>,
    /// Human-readable name for this node
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
}

fn default_name() -> String {
    local_hostname().unwrap_or_else(|| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host other nodes should use to reach this one (default: hostname)
    pub advertise_host: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Whole-call timeout in ms
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Largest frame accepted or sent
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            advertise_host: None,
            connect_timeout_ms: default_connect_timeout(),
            call_timeout_ms: default_call_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Endpoints (`host:port`) tried in order when joining
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Ping peers this often (ms) and drop the silent ones; 0 disables
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_sweep_interval() -> u64 {
    10_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_short_running_slots")]
    pub short_running_slots: usize,
    #[serde(default = "default_long_running_slots")]
    pub long_running_slots: usize,
    /// How long START_WORK may wait for a slot
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
}

fn default_short_running_slots() -> usize {
    10
}

fn default_long_running_slots() -> usize {
    5
}

fn default_start_timeout() -> u64 {
    10_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            short_running_slots: default_short_running_slots(),
            long_running_slots: default_long_running_slots(),
            start_timeout_ms: default_start_timeout(),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub selector: Selector,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("workmesh/config.toml")),
            Some(PathBuf::from("./workmesh.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Host advertised to other nodes
    pub fn advertise_host(&self) -> String {
        self.network
            .advertise_host
            .clone()
            .or_else(local_hostname)
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Settings for the server and client
    pub fn network_settings(&self) -> NetSettings {
        NetSettings {
            bind_address: self.network.bind_address.clone(),
            port: self.network.port,
            connect_timeout_ms: self.network.connect_timeout_ms,
            call_timeout_ms: self.network.call_timeout_ms,
            max_message_size: self.network.max_message_size,
        }
    }

    /// Liveness sweep period, `None` when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.cluster.sweep_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn engine_settings(&self) -> EngineConfig {
        EngineConfig {
            short_running_slots: self.engine.short_running_slots,
            long_running_slots: self.engine.long_running_slots,
            start_timeout: Duration::from_millis(self.engine.start_timeout_ms),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            node_id: Some("worker-01".to_string()),
            name: "Build Worker 01".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            advertise_host: Some("10.0.0.11".to_string()),
            ..Default::default()
        },
        cluster: ClusterConfig {
            seeds: vec!["10.0.0.10:24900".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
