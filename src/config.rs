//! Configuration handling for nas-tunnel

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "nas-tunnel.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Specify either an interface name or a config file, not both")]
    ConflictingSelector,
    #[error("An interface name or a config file is required")]
    MissingSelector,
    #[error("Invalid interface name: {0:?}")]
    InvalidInterfaceName(String),
    #[error("Tunnel config file does not exist: {0}")]
    TunnelConfigNotFound(PathBuf),
    #[error("Polling interval must be greater than zero")]
    ZeroInterval,
    #[error("confirm_polls must be at least 1")]
    ZeroConfirmPolls,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wireguard: WireGuardConfig,
    pub inspector: InspectorConfig,
    pub monitor: MonitorConfig,
    pub export: ExportConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    /// Directory holding `<interface>.conf` files
    pub config_dir: PathBuf,
    pub wg: String,
    pub wg_quick: String,
    /// Upper bound on any single `wg` / `wg-quick` invocation
    pub command_timeout_secs: u64,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/wireguard"),
            wg: "wg".to_string(),
            wg_quick: "wg-quick".to_string(),
            command_timeout_secs: 15,
        }
    }
}

impl WireGuardConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InspectorBackend {
    /// Ask the appliance middleware for its job list
    Middleware,
    /// Look for replication receive processes in the process table
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub backend: InspectorBackend,
    pub midclt: String,
    /// Job methods starting with any of these count as replication
    pub method_prefixes: Vec<String>,
    pub pgrep: String,
    pub process_pattern: String,
    pub query_timeout_secs: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            backend: InspectorBackend::Middleware,
            midclt: "midclt".to_string(),
            method_prefixes: vec!["replication.".to_string(), "zettarepl.".to_string()],
            pgrep: "pgrep".to_string(),
            process_pattern: "zfs recv".to_string(),
            query_timeout_secs: 4,
        }
    }
}

impl InspectorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlinePolicy {
    /// The grace window is a ceiling on total wait time
    #[default]
    HardDeadline,
    /// Each poll that sees activity pushes the deadline out by a full window
    ExtendOnActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub policy: DeadlinePolicy,
    pub confirm_polls: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_secs: 5,
            policy: DeadlinePolicy::HardDeadline,
            confirm_polls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Where the appliance keeps its configuration database
    pub source_dir: PathBuf,
    pub database_file: String,
    pub secret_file: String,
    /// File whose contents name the running appliance version
    pub version_file: PathBuf,
    pub retention_days: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("/data"),
            database_file: "freenas-v1.db".to_string(),
            secret_file: "pwenc_secret".to_string(),
            version_file: PathBuf::from("/etc/version"),
            retention_days: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window_hours: f64,
    pub msg_up: String,
    pub msg_down: String,
    pub push_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_hours: 24.0,
            msg_up: "Replication OK".to_string(),
            msg_down: "Replication not up to date".to_string(),
            push_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load config from an explicit path, or from the first default location
    /// that exists, falling back to built-in defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            debug!("Loading config from {}", path.display());
            return Self::load(path);
        }

        for candidate in default_locations() {
            if candidate.exists() {
                info!("Using config file {}", candidate.display());
                return Self::load(&candidate);
            }
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        locations.push(dir.join("nas-tunnel").join("config.toml"));
    }
    locations.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_operational_values() {
        let config = Config::default();
        assert_eq!(config.monitor.timeout_secs, 60);
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.monitor.policy, DeadlinePolicy::HardDeadline);
        assert_eq!(config.monitor.confirm_polls, 1);
        assert_eq!(config.wireguard.config_dir, PathBuf::from("/etc/wireguard"));
        assert_eq!(config.inspector.backend, InspectorBackend::Middleware);
        assert_eq!(config.export.retention_days, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[monitor]\ntimeout_secs = 600\npolicy = \"extend-on-activity\"\n\n\
             [inspector]\nbackend = \"process\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.monitor.timeout_secs, 600);
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.monitor.policy, DeadlinePolicy::ExtendOnActivity);
        assert_eq!(config.inspector.backend, InspectorBackend::Process);
        assert_eq!(config.inspector.process_pattern, "zfs recv");
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.inspector.method_prefixes = vec!["replication.run".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.inspector.method_prefixes, vec!["replication.run"]);
    }

    #[test]
    fn test_discover_explicit_missing_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        let result = Config::discover(Some(&path));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let result: Result<Config, _> = toml::from_str("[monitor]\npolicy = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::ZeroInterval.to_string(),
            "Polling interval must be greater than zero"
        );
        assert_eq!(
            ConfigError::ConflictingSelector.to_string(),
            "Specify either an interface name or a config file, not both"
        );
    }
}
