//! Emulator configuration model.
//!
//! A [`Configuration`] is a plain bag of QEMU parameters. Setters never
//! validate; all checking happens when the configuration is turned into an
//! [`Invocation`] (see [`invocation`]).
//!
//! Configurations persist as TOML:
//!
//! ```toml
//! cpu = "x86_64"
//! cpu_count = 2
//! memory_mb = 512
//! starting_port = 6000
//!
//! [drive_a]
//! path = "disk.qcow2"
//! qcow2 = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigFileError;

pub mod invocation;

pub use invocation::{Invocation, PortPair};

// ---------------------------------------------------------------------------
// Default option sets
// ---------------------------------------------------------------------------

const PROCESSOR_TYPES: &[&str] = &[
    "aarch64", "alpha", "arm", "cris", "i386", "lm32", "m68k", "microblaze", "microblazeel",
    "mips", "mips64", "mips64el", "mipsel", "moxie", "or32", "ppc", "ppc64", "ppc64le", "sh4",
    "sh4eb", "sparc", "sparc64", "tricore", "unicore32", "x86_64", "xtensa", "xtenseb",
];

const NETWORK_ADAPTER_TYPES: &[&str] = &[
    "e1000", "i82551", "i82557b", "i82559er", "lance", "mcf_fec", "ne2k_isa", "ne2k_pci",
    "pcnet", "rtl8139", "smc91c111", "virtio",
];

const VGA_TYPES: &[&str] = &["cg3", "cirrus", "qxl", "std", "tcx", "virtio", "vmware"];

const MIN_MEMORY_MB: u32 = 128;
const MAX_MEMORY_MB: u32 = 8 * 1024;

/// NIC model used when the configuration leaves the adapter type empty.
pub const DEFAULT_NETWORK_ADAPTER: &str = "ne2k_pci";

/// Display backend passed to `-display` unless overridden.
pub const DEFAULT_DISPLAY: &str = "sdl";

/// Processor architectures QEMU ships a `qemu-system-<arch>` binary for.
pub fn processor_types() -> &'static [&'static str] {
    PROCESSOR_TYPES
}

/// NIC models offered by default.
pub fn network_adapter_types() -> &'static [&'static str] {
    NETWORK_ADAPTER_TYPES
}

/// Video adapter models offered by default.
pub fn vga_types() -> &'static [&'static str] {
    VGA_TYPES
}

/// Memory sizes in megabytes: doublings of 128 up to 8192.
pub fn memory_sizes() -> Vec<u32> {
    std::iter::successors(Some(MIN_MEMORY_MB), |mb| mb.checked_mul(2))
        .take_while(|mb| *mb <= MAX_MEMORY_MB)
        .collect()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A disk image attached with `-drive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub path: String,
    #[serde(default)]
    pub qcow2: bool,
}

/// Everything needed to build a QEMU command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    cpu: String,
    cpu_count: u32,
    network_adapter: String,
    vga: String,
    display: String,
    memory_mb: u32,
    starting_port: u16,
    human_interface: bool,
    other_options: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    optical_drive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drive_a: Option<Drive>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drive_b: Option<Drive>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cpu: "x86_64".to_string(),
            cpu_count: 1,
            network_adapter: DEFAULT_NETWORK_ADAPTER.to_string(),
            vga: "std".to_string(),
            display: DEFAULT_DISPLAY.to_string(),
            memory_mb: 512,
            starting_port: 6000,
            human_interface: true,
            other_options: String::new(),
            optical_drive: None,
            drive_a: None,
            drive_b: None,
        }
    }
}

/// An empty path clears the drive.
fn drive_from(path: &str, qcow2: bool) -> Option<Drive> {
    if path.is_empty() {
        None
    } else {
        Some(Drive {
            path: path.to_string(),
            qcow2,
        })
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    // -- drives ------------------------------------------------------------

    pub fn set_drive_a(&mut self, path: impl AsRef<str>, qcow2: bool) {
        self.drive_a = drive_from(path.as_ref(), qcow2);
    }

    pub fn drive_a(&self) -> Option<&Drive> {
        self.drive_a.as_ref()
    }

    pub fn set_drive_b(&mut self, path: impl AsRef<str>, qcow2: bool) {
        self.drive_b = drive_from(path.as_ref(), qcow2);
    }

    pub fn drive_b(&self) -> Option<&Drive> {
        self.drive_b.as_ref()
    }

    pub fn set_optical_drive(&mut self, path: impl AsRef<str>) {
        let path = path.as_ref();
        self.optical_drive = (!path.is_empty()).then(|| path.to_string());
    }

    pub fn optical_drive(&self) -> Option<&str> {
        self.optical_drive.as_deref()
    }

    // -- processor ---------------------------------------------------------

    pub fn set_processor_type(&mut self, cpu: impl Into<String>) {
        self.cpu = cpu.into();
    }

    pub fn processor_type(&self) -> &str {
        &self.cpu
    }

    pub fn set_cpu_count(&mut self, count: u32) {
        self.cpu_count = count;
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    // -- devices -----------------------------------------------------------

    pub fn set_network_adapter(&mut self, model: impl Into<String>) {
        self.network_adapter = model.into();
    }

    pub fn network_adapter(&self) -> &str {
        &self.network_adapter
    }

    pub fn set_vga_type(&mut self, vga: impl Into<String>) {
        self.vga = vga.into();
    }

    pub fn vga_type(&self) -> &str {
        &self.vga
    }

    pub fn set_display(&mut self, backend: impl Into<String>) {
        self.display = backend.into();
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn set_memory_mb(&mut self, megabytes: u32) {
        self.memory_mb = megabytes;
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    // -- control sockets ---------------------------------------------------

    /// The QMP socket listens on this port; the monitor takes the next one.
    pub fn set_starting_port(&mut self, port: u16) {
        self.starting_port = port;
    }

    pub fn starting_port(&self) -> u16 {
        self.starting_port
    }

    pub fn enable_human_interface(&mut self, enable: bool) {
        self.human_interface = enable;
    }

    pub fn human_interface_enabled(&self) -> bool {
        self.human_interface
    }

    /// Extra arguments appended after the display flag, split on whitespace.
    pub fn set_other_options(&mut self, options: impl Into<String>) {
        self.other_options = options.into();
    }

    pub fn other_options(&self) -> &str {
        &self.other_options
    }

    // -- persistence -------------------------------------------------------

    /// Serialize to a TOML document.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialize from a TOML document. Missing keys take their defaults.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigFileError> {
        let body = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigFileError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, body).map_err(|source| ConfigFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Read a configuration previously written by [`Configuration::save`].
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let body = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&body).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), cpu = %config.cpu, "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes_are_doublings_of_128() {
        assert_eq!(memory_sizes(), vec![128, 256, 512, 1024, 2048, 4096, 8192]);
    }

    #[test]
    fn option_sets_contain_the_defaults() {
        assert!(processor_types().contains(&"x86_64"));
        assert!(network_adapter_types().contains(&DEFAULT_NETWORK_ADAPTER));
        assert!(vga_types().contains(&Configuration::default().vga_type()));
    }

    #[test]
    fn empty_drive_path_clears_drive() {
        let mut cfg = Configuration::new();
        cfg.set_drive_a("disk.qcow2", true);
        assert_eq!(cfg.drive_a().map(|d| d.qcow2), Some(true));

        cfg.set_drive_a("", true);
        assert!(cfg.drive_a().is_none());
    }

    #[test]
    fn toml_roundtrip_preserves_every_field() {
        let mut cfg = Configuration::new();
        cfg.set_drive_a("/vms/a.qcow2", true);
        cfg.set_drive_b("/vms/b.img", false);
        cfg.set_optical_drive("/isos/install.iso");
        cfg.set_processor_type("aarch64");
        cfg.set_cpu_count(4);
        cfg.set_network_adapter("virtio");
        cfg.set_vga_type("qxl");
        cfg.set_display("none");
        cfg.set_memory_mb(2048);
        cfg.set_starting_port(7000);
        cfg.enable_human_interface(false);
        cfg.set_other_options("-no-reboot");

        let text = cfg.to_toml().expect("serialize");
        let back = Configuration::from_toml(&text).expect("parse");
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let cfg = Configuration::from_toml("cpu_count = 2\n").expect("parse");
        assert_eq!(cfg.cpu_count(), 2);
        assert_eq!(cfg.processor_type(), "x86_64");
        assert_eq!(cfg.starting_port(), 6000);
        assert!(cfg.human_interface_enabled());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Configuration::from_toml("vnc = true\n").is_err());
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("vm.toml");

        let mut cfg = Configuration::new();
        cfg.set_drive_a("disk.qcow2", true);
        cfg.save(&path).expect("save");

        let back = Configuration::load(&path).expect("load");
        assert_eq!(back, cfg);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Configuration::load(Path::new("/nonexistent/blast/vm.toml")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Io { .. }));
    }
}
