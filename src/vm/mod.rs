//! Emulator process management.
//!
//! [`VmController`] owns the QEMU subprocess, its QMP session and its monitor
//! console. This module holds the types shared with callers: the observable
//! [`VmState`], the [`Operation`]s it gates, and the [`ControllerOptions`]
//! that bound every wait.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigFileError;

pub mod lifecycle;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Observed lifecycle state of the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// No process has been started yet.
    NotStarted,
    /// The process is spawned and the QMP handshake is in progress.
    Starting,
    /// QMP is negotiated and the guest is executing.
    Running,
    /// The guest is stopped; the process is alive.
    Paused,
    /// A stop or power-off is waiting for the process to exit.
    Stopping,
    /// The process has exited under our control.
    Stopped,
    /// The process exited or the QMP link dropped unexpectedly.
    Crashed,
}

/// Requests gated by [`VmState::permits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Pause,
    Resume,
    Reset,
    Stop,
    PowerOff,
    /// Monitor passthrough, screendump and status queries.
    Command,
    Snapshot,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Pause => "pause",
            Operation::Resume => "continue",
            Operation::Reset => "reset",
            Operation::Stop => "stop",
            Operation::PowerOff => "power off",
            Operation::Command => "command",
            Operation::Snapshot => "snapshot",
        }
    }
}

impl VmState {
    pub fn permits(self, op: Operation) -> bool {
        use VmState::*;
        match op {
            Operation::Start => matches!(self, NotStarted | Stopped),
            Operation::Pause => self == Running,
            Operation::Resume => self == Paused,
            Operation::Reset | Operation::Command => matches!(self, Running | Paused),
            Operation::Stop | Operation::PowerOff => {
                matches!(self, Starting | Running | Paused | Crashed)
            }
            Operation::Snapshot => self == Running,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::NotStarted => "not started",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Controller tuning, loadable from `controller.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerOptions {
    /// Directory holding the `qemu-system-*` binaries. Searched on `PATH`
    /// when unset.
    pub qemu_dir: Option<PathBuf>,
    /// Connect, greeting and `qmp_capabilities`, all together.
    pub handshake_timeout_ms: u64,
    /// Wait for any single QMP reply.
    pub command_timeout_ms: u64,
    /// Wait for exit after `quit` before killing.
    pub stop_grace_ms: u64,
    /// Wait for exit after `system_powerdown` before killing.
    pub power_off_grace_ms: u64,
    /// Wait for exit after a kill.
    pub kill_timeout_ms: u64,
    /// Notifications buffered per subscriber.
    pub event_buffer: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            qemu_dir: None,
            handshake_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            stop_grace_ms: 10_000,
            power_off_grace_ms: 30_000,
            kill_timeout_ms: 5_000,
            event_buffer: crate::events::DEFAULT_CAPACITY,
        }
    }
}

impl ControllerOptions {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn power_off_grace(&self) -> Duration {
        Duration::from_millis(self.power_off_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let body = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options = toml::from_str(&body).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "controller options loaded");
        Ok(options)
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::{GuestStatus, ProcessExit, VmController};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_from_rest() {
        for state in [VmState::NotStarted, VmState::Stopped] {
            assert!(state.permits(Operation::Start));
        }
        for state in [
            VmState::Starting,
            VmState::Running,
            VmState::Paused,
            VmState::Stopping,
            VmState::Crashed,
        ] {
            assert!(!state.permits(Operation::Start), "{state} must reject start");
        }
    }

    #[test]
    fn guest_commands_need_a_live_session() {
        assert!(VmState::Running.permits(Operation::Pause));
        assert!(!VmState::Paused.permits(Operation::Pause));
        assert!(VmState::Paused.permits(Operation::Resume));
        assert!(!VmState::Running.permits(Operation::Resume));
        assert!(VmState::Paused.permits(Operation::Reset));
        assert!(!VmState::NotStarted.permits(Operation::Pause));
        assert!(!VmState::Starting.permits(Operation::Command));
        assert!(VmState::Running.permits(Operation::Snapshot));
        assert!(!VmState::Paused.permits(Operation::Snapshot));
    }

    #[test]
    fn stop_from_any_non_terminal_state() {
        assert!(VmState::Crashed.permits(Operation::Stop));
        assert!(VmState::Starting.permits(Operation::PowerOff));
        assert!(!VmState::Stopped.permits(Operation::Stop));
        assert!(!VmState::NotStarted.permits(Operation::Stop));
        assert!(!VmState::Stopping.permits(Operation::Stop));
    }

    #[test]
    fn options_parse_partial_toml() {
        let options: ControllerOptions =
            toml::from_str("command_timeout_ms = 250\nqemu_dir = \"/opt/qemu/bin\"\n").unwrap();
        assert_eq!(options.command_timeout(), Duration::from_millis(250));
        assert_eq!(options.qemu_dir, Some(PathBuf::from("/opt/qemu/bin")));
        assert_eq!(options.power_off_grace(), Duration::from_secs(30));
    }
}
