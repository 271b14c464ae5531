//! Tunnel control
//!
//! A tunnel is a WireGuard interface identified either by name (resolved
//! against the WireGuard config directory) or by an explicit config file.
//! The [`TunnelController`] trait is the seam the shutdown monitor drives;
//! [`wireguard::WgQuickController`] implements it with `wg` and `wg-quick`.

pub mod wireguard;

pub use wireguard::WgQuickController;

use crate::command::CommandError;
use crate::config::ConfigError;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_INTERFACE_NAME_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Failed to bring up {interface}: {message}")]
    ActivateFailed { interface: String, message: String },
    #[error("Failed to bring down {interface}: {message}")]
    DeactivateFailed { interface: String, message: String },
    #[error("Could not tell whether {interface} is up: {message}")]
    ProbeFailed { interface: String, message: String },
}

/// How the operator named the tunnel on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSelector {
    Name(String),
    ConfigPath(PathBuf),
}

impl TunnelSelector {
    /// Build a selector from the two mutually exclusive CLI inputs.
    pub fn from_args(
        name: Option<String>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        match (name, config_path) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingSelector),
            (None, None) => Err(ConfigError::MissingSelector),
            (Some(name), None) => Ok(Self::Name(name)),
            (None, Some(path)) => Ok(Self::ConfigPath(path)),
        }
    }

    /// Resolve to a concrete interface and config file.
    ///
    /// The config file must exist; `wg-quick` needs it for both directions.
    pub fn resolve(&self, config_dir: &Path) -> Result<TunnelHandle, ConfigError> {
        let (interface, config_path) = match self {
            Self::Name(name) => {
                validate_interface_name(name)?;
                (name.clone(), config_dir.join(format!("{}.conf", name)))
            }
            Self::ConfigPath(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                validate_interface_name(&stem)?;
                (stem, path.clone())
            }
        };

        if !config_path.is_file() {
            return Err(ConfigError::TunnelConfigNotFound(config_path));
        }

        Ok(TunnelHandle {
            interface,
            config_path,
        })
    }
}

fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidInterfaceName(name.to_string()))
    }
}

/// A resolved tunnel; immutable for the rest of the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    interface: String,
    config_path: PathBuf,
}

impl TunnelHandle {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.interface, self.config_path.display())
    }
}

/// Query and toggle the state of a tunnel interface
#[async_trait]
pub trait TunnelController: Send + Sync {
    /// Whether the interface is currently up. Must not change anything.
    async fn is_active(&self, handle: &TunnelHandle) -> Result<bool, TunnelError>;

    /// Bring the interface up. Succeeds if it is already up.
    async fn activate(&self, handle: &TunnelHandle) -> Result<(), TunnelError>;

    /// Bring the interface down. Succeeds if it is already down.
    async fn deactivate(&self, handle: &TunnelHandle) -> Result<(), TunnelError>;
}
