//! Named VM snapshots through the monitor passthrough.

use tracing::{info, warn};

use crate::error::ControllerError;
use crate::monitor::MonitorChannel;

/// Issues `savevm` / `loadvm` on behalf of the controller.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    monitor: MonitorChannel,
}

impl SnapshotManager {
    pub fn new(monitor: MonitorChannel) -> Self {
        Self { monitor }
    }

    /// Names travel on a monitor command line, so they may not contain
    /// whitespace or control characters. Uniqueness is the emulator's call.
    pub fn validate_name(name: &str) -> Result<(), ControllerError> {
        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ControllerError::InvalidSnapshotName(name.to_string()));
        }
        Ok(())
    }

    /// Pause the guest if it is running, save, then resume it whether or not
    /// the save succeeded.
    pub async fn save(&self, name: &str) -> Result<(), ControllerError> {
        Self::validate_name(name)?;

        let was_running = self.guest_running().await?;
        if was_running {
            self.monitor.qmp().execute("stop", None).await?;
        }

        let saved = self.run(name, format!("savevm {name}")).await;

        if was_running {
            if let Err(e) = self.monitor.qmp().execute("cont", None).await {
                warn!(snapshot = name, error = %e, "failed to resume after savevm");
                // A failed save takes precedence.
                saved?;
                return Err(e.into());
            }
        }

        saved?;
        info!(snapshot = name, "snapshot saved");
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<(), ControllerError> {
        Self::validate_name(name)?;
        self.run(name, format!("loadvm {name}")).await?;
        info!(snapshot = name, "snapshot loaded");
        Ok(())
    }

    async fn guest_running(&self) -> Result<bool, ControllerError> {
        let status = self.monitor.qmp().execute("query-status", None).await?;
        Ok(status
            .get("running")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false))
    }

    async fn run(&self, name: &str, command_line: String) -> Result<(), ControllerError> {
        let reply = self.monitor.execute(&command_line).await?;
        // The monitor reports savevm/loadvm failures as text, not QMP errors.
        if reply.trim_start().starts_with("Error") {
            return Err(ControllerError::Snapshot {
                name: name.to_string(),
                reason: reply.trim().to_string(),
            });
        }
        Ok(())
    }
}
