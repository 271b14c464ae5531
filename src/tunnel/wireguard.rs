//! WireGuard tunnel control via `wg` and `wg-quick`

use super::{TunnelController, TunnelError, TunnelHandle};
use crate::command::{self, failure_message};
use crate::config::WireGuardConfig;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What `wg show` reports for an interface that does not exist
const NO_SUCH_DEVICE: &str = "No such device";

pub struct WgQuickController {
    wg: String,
    wg_quick: String,
    timeout: Duration,
}

impl WgQuickController {
    pub fn new(config: &WireGuardConfig) -> Self {
        Self {
            wg: config.wg.clone(),
            wg_quick: config.wg_quick.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// Run `wg-quick <action> <config>`; `Some(message)` if it failed.
    async fn wg_quick(
        &self,
        action: &str,
        handle: &TunnelHandle,
    ) -> Result<Option<String>, TunnelError> {
        let output = command::run(
            &self.wg_quick,
            [OsStr::new(action), handle.config_path().as_os_str()],
            self.timeout,
        )
        .await?;

        if output.status.success() {
            Ok(None)
        } else {
            Ok(Some(failure_message(&output)))
        }
    }
}

impl Default for WgQuickController {
    fn default() -> Self {
        Self::new(&WireGuardConfig::default())
    }
}

#[async_trait]
impl TunnelController for WgQuickController {
    async fn is_active(&self, handle: &TunnelHandle) -> Result<bool, TunnelError> {
        let output = command::run(&self.wg, ["show", handle.interface()], self.timeout).await?;
        let active = if output.status.success() {
            true
        } else if String::from_utf8_lossy(&output.stderr).contains(NO_SUCH_DEVICE) {
            false
        } else {
            // Permission errors and the like say nothing about the interface
            return Err(TunnelError::ProbeFailed {
                interface: handle.interface().to_string(),
                message: failure_message(&output),
            });
        };
        debug!("Interface {} active: {}", handle.interface(), active);
        Ok(active)
    }

    async fn activate(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        if self.is_active(handle).await? {
            info!("Interface {} is already up", handle.interface());
            return Ok(());
        }

        match self.wg_quick("up", handle).await? {
            None => {
                info!("Interface {} brought up", handle.interface());
                Ok(())
            }
            Some(message) => Err(TunnelError::ActivateFailed {
                interface: handle.interface().to_string(),
                message,
            }),
        }
    }

    async fn deactivate(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        match self.is_active(handle).await {
            Ok(false) => {
                info!("Interface {} is already down", handle.interface());
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => warn!("{}, trying wg-quick down anyway", e),
        }

        let Some(message) = self.wg_quick("down", handle).await? else {
            info!("Interface {} brought down", handle.interface());
            return Ok(());
        };

        // Someone else may have taken it down between the check and our call
        if let Ok(false) = self.is_active(handle).await {
            warn!(
                "wg-quick down {} failed ({}), but the interface is down",
                handle.interface(),
                message
            );
            return Ok(());
        }

        Err(TunnelError::DeactivateFailed {
            interface: handle.interface().to_string(),
            message,
        })
    }
}
