//! Application directory structure for blast-processing.
//!
//! - Config: `~/.config/blast-processing/` (`vm.toml`, `controller.toml`)
//! - Data:   `~/.local/share/blast-processing/` (screendumps)
//! - Logs:   `~/.local/share/blast-processing/logs/`, or
//!   `~/Library/Logs/blast-processing/` on macOS
//!
//! `XDG_CONFIG_HOME` and `XDG_DATA_HOME` are honoured when set.

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "blast-processing";

/// File name of the persisted VM configuration.
pub const VM_CONFIG_FILE: &str = "vm.toml";
/// File name of the controller timeouts.
pub const CONTROLLER_CONFIG_FILE: &str = "controller.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlastPaths {
    /// Human-editable configuration
    pub config: PathBuf,
    /// Machine-managed data
    pub data: PathBuf,
    /// Screendumps taken from the CLI
    pub screendumps: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl BlastPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(&home))
    }

    fn under(home: &Path) -> Self {
        let data = resolve_data_dir(home);
        Self {
            config: resolve_config_dir(home),
            screendumps: data.join("screendumps"),
            logs: resolve_log_dir(home),
            data,
        }
    }

    pub fn vm_config(&self) -> PathBuf {
        self.config.join(VM_CONFIG_FILE)
    }

    pub fn controller_config(&self) -> PathBuf {
        self.config.join(CONTROLLER_CONFIG_FILE)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.screendumps, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}
