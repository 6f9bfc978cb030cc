//! Turning a [`Configuration`] into a QEMU command line.
//!
//! Argument groups are always emitted in the same order:
//!
//! ```text
//! cpu → drives → network → qmp → monitor → other → memory
//! ```

use std::fmt;

use tracing::debug;

use super::{
    Configuration, DEFAULT_NETWORK_ADAPTER, Drive, memory_sizes, network_adapter_types,
    processor_types, vga_types,
};
use crate::error::ValidationError;

/// Name shared by the NIC and the user-mode network backend.
const NET_ID: &str = "testNet";

/// Host-forward rule of the user-mode network.
const HOST_FORWARD: &str = "tcp:127.0.0.1:2222-:23";

/// The control ports declared on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub qmp: u16,
    /// `None` when the human interface is disabled.
    pub monitor: Option<u16>,
}

/// A fully resolved emulator command line plus advisory warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    ports: PortPair,
    warnings: Vec<String>,
}

impl Invocation {
    /// `qemu-system-<arch>`.
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn ports(&self) -> PortPair {
        self.ports
    }

    /// Non-default option values; the caller decides whether to proceed.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl Configuration {
    /// The QMP port and, when the human interface is enabled, the monitor port.
    pub fn port_pair(&self) -> Result<PortPair, ValidationError> {
        let monitor = if self.human_interface {
            Some(
                self.starting_port
                    .checked_add(1)
                    .ok_or(ValidationError::PortOutOfRange(self.starting_port))?,
            )
        } else {
            None
        };
        Ok(PortPair {
            qmp: self.starting_port,
            monitor,
        })
    }

    /// Validate the configuration and build the emulator command line.
    pub fn build_invocation(&self) -> Result<Invocation, ValidationError> {
        let mut args = Vec::new();
        let mut warnings = Vec::new();

        let program = push_cpu_args(self, &mut args)?;
        push_drive_args(self, &mut args)?;
        let ports = self.port_pair()?;

        push_network_args(self, &mut args, &mut warnings);
        push_qmp_args(ports, &mut args);
        push_monitor_args(ports, &mut args);
        push_other_args(self, &mut args);
        push_memory_args(self, &mut args);

        if !processor_types().contains(&self.cpu.as_str()) {
            warnings.push(format!(
                "Processor {} is not in the default list of processors",
                self.cpu
            ));
        }
        if !vga_types().contains(&self.vga.as_str()) {
            warnings.push(format!(
                "Video adapter {} is not in the default list of video adapters",
                self.vga
            ));
        }
        if !memory_sizes().contains(&self.memory_mb) {
            warnings.push(format!(
                "Memory size {} MB is not in the default list of memory sizes",
                self.memory_mb
            ));
        }

        let invocation = Invocation {
            program,
            args,
            ports,
            warnings,
        };
        debug!(command = %invocation, warnings = invocation.warnings.len(), "built invocation");
        Ok(invocation)
    }
}

// ---------------------------------------------------------------------------
// Argument groups
// ---------------------------------------------------------------------------

fn push_cpu_args(cfg: &Configuration, args: &mut Vec<String>) -> Result<String, ValidationError> {
    if cfg.cpu.is_empty() {
        return Err(ValidationError::MissingCpuType);
    }
    if cfg.cpu_count == 0 {
        return Err(ValidationError::NoCpus);
    }
    if cfg.cpu_count > 1 {
        args.push("-smp".to_string());
        args.push(cfg.cpu_count.to_string());
    }
    Ok(format!("qemu-system-{}", cfg.cpu))
}

fn drive_arg(drive: &Drive) -> String {
    if drive.qcow2 {
        format!("file={},format=qcow2", drive.path)
    } else {
        format!("file={}", drive.path)
    }
}

fn push_drive_args(cfg: &Configuration, args: &mut Vec<String>) -> Result<(), ValidationError> {
    if let (None, Some(b)) = (&cfg.drive_a, &cfg.drive_b) {
        return Err(ValidationError::DriveBWithoutDriveA(b.path.clone()));
    }
    for drive in [&cfg.drive_a, &cfg.drive_b].into_iter().flatten() {
        args.push("-drive".to_string());
        args.push(drive_arg(drive));
    }
    if let Some(iso) = &cfg.optical_drive {
        args.push("-cdrom".to_string());
        args.push(iso.clone());
    }
    Ok(())
}

fn push_network_args(cfg: &Configuration, args: &mut Vec<String>, warnings: &mut Vec<String>) {
    let model = if cfg.network_adapter.is_empty() {
        warnings.push(format!(
            "No network adapter specified, using {DEFAULT_NETWORK_ADAPTER}"
        ));
        DEFAULT_NETWORK_ADAPTER
    } else {
        if !network_adapter_types().contains(&cfg.network_adapter.as_str()) {
            warnings.push(format!(
                "Network adapter {} is not in the default list of NICs",
                cfg.network_adapter
            ));
        }
        cfg.network_adapter.as_str()
    };

    args.push("-net".to_string());
    args.push(format!("nic,model={model},name={NET_ID}"));
    args.push("-net".to_string());
    args.push(format!("user,id={NET_ID},hostfwd={HOST_FORWARD}"));
}

fn push_qmp_args(ports: PortPair, args: &mut Vec<String>) {
    args.push("-qmp".to_string());
    args.push(format!("tcp::{},server,nowait", ports.qmp));
}

fn push_monitor_args(ports: PortPair, args: &mut Vec<String>) {
    if let Some(port) = ports.monitor {
        args.push("-monitor".to_string());
        args.push(format!("tcp::{port},server,nowait"));
    }
}

fn push_other_args(cfg: &Configuration, args: &mut Vec<String>) {
    args.push("-display".to_string());
    args.push(cfg.display.clone());
    args.extend(cfg.other_options.split_whitespace().map(str::to_string));
}

fn push_memory_args(cfg: &Configuration, args: &mut Vec<String>) {
    args.push("-m".to_string());
    args.push(cfg.memory_mb.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Configuration {
        let mut cfg = Configuration::new();
        cfg.set_processor_type("x86_64");
        cfg.set_cpu_count(1);
        cfg.set_memory_mb(512);
        cfg
    }

    fn flag_value<'a>(inv: &'a Invocation, flag: &str) -> Option<&'a str> {
        let args = inv.args();
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn reference_scenario_matches_exactly() {
        let mut cfg = base();
        cfg.set_cpu_count(2);
        cfg.set_drive_a("disk.qcow2", true);
        cfg.set_starting_port(6000);
        cfg.enable_human_interface(true);

        let inv = cfg.build_invocation().expect("valid configuration");
        assert_eq!(
            inv.to_string(),
            "qemu-system-x86_64 -smp 2 -drive file=disk.qcow2,format=qcow2 \
             -net nic,model=ne2k_pci,name=testNet \
             -net user,id=testNet,hostfwd=tcp:127.0.0.1:2222-:23 \
             -qmp tcp::6000,server,nowait -monitor tcp::6001,server,nowait \
             -display sdl -m 512"
        );
        assert!(inv.warnings().is_empty());
    }

    #[test]
    fn empty_cpu_type_is_rejected() {
        let mut cfg = base();
        cfg.set_processor_type("");
        assert_eq!(cfg.build_invocation(), Err(ValidationError::MissingCpuType));
    }

    #[test]
    fn zero_cpus_is_rejected() {
        let mut cfg = base();
        cfg.set_cpu_count(0);
        assert_eq!(cfg.build_invocation(), Err(ValidationError::NoCpus));
    }

    #[test]
    fn drive_b_without_drive_a_is_rejected() {
        let mut cfg = base();
        cfg.set_drive_b("b.img", false);
        assert_eq!(
            cfg.build_invocation(),
            Err(ValidationError::DriveBWithoutDriveA("b.img".to_string()))
        );
    }

    #[test]
    fn smp_only_for_multiple_cpus() {
        for count in 1..=16u32 {
            let mut cfg = base();
            cfg.set_cpu_count(count);
            let inv = cfg.build_invocation().unwrap();
            if count > 1 {
                assert_eq!(flag_value(&inv, "-smp"), Some(count.to_string().as_str()));
            } else {
                assert!(!inv.args().iter().any(|a| a == "-smp"));
            }
        }
    }

    #[test]
    fn qcow2_suffix_is_per_drive() {
        let mut cfg = base();
        cfg.set_drive_a("a.img", false);
        cfg.set_drive_b("b.qcow2", true);
        let inv = cfg.build_invocation().unwrap();
        let drives: Vec<&String> = inv
            .args()
            .windows(2)
            .filter(|w| w[0] == "-drive")
            .map(|w| &w[1])
            .collect();
        assert_eq!(drives, ["file=a.img", "file=b.qcow2,format=qcow2"]);
    }

    #[test]
    fn ports_follow_starting_port() {
        for (port, human) in [(5000u16, true), (5000, false), (65534, true), (65535, false)] {
            let mut cfg = base();
            cfg.set_starting_port(port);
            cfg.enable_human_interface(human);
            let inv = cfg.build_invocation().unwrap();

            assert_eq!(
                flag_value(&inv, "-qmp"),
                Some(format!("tcp::{port},server,nowait").as_str())
            );
            if human {
                assert_eq!(
                    flag_value(&inv, "-monitor"),
                    Some(format!("tcp::{},server,nowait", port + 1).as_str())
                );
                assert_eq!(inv.ports().monitor, Some(port + 1));
            } else {
                assert!(flag_value(&inv, "-monitor").is_none());
                assert_eq!(inv.ports().monitor, None);
            }
        }
    }

    #[test]
    fn monitor_port_overflow_is_rejected() {
        let mut cfg = base();
        cfg.set_starting_port(u16::MAX);
        cfg.enable_human_interface(true);
        assert_eq!(
            cfg.build_invocation(),
            Err(ValidationError::PortOutOfRange(u16::MAX))
        );
    }

    #[test]
    fn off_list_values_warn_but_build() {
        let mut cfg = base();
        cfg.set_processor_type("riscv64");
        cfg.set_network_adapter("fancy-nic");
        cfg.set_vga_type("voodoo");
        cfg.set_memory_mb(3000);

        let inv = cfg.build_invocation().expect("warnings never block");
        assert_eq!(inv.program(), "qemu-system-riscv64");
        assert_eq!(inv.warnings().len(), 4);
        assert_eq!(
            flag_value(&inv, "-net"),
            Some("nic,model=fancy-nic,name=testNet")
        );
    }

    #[test]
    fn empty_network_adapter_falls_back_with_warning() {
        let mut cfg = base();
        cfg.set_network_adapter("");
        let inv = cfg.build_invocation().unwrap();
        assert_eq!(flag_value(&inv, "-net"), Some("nic,model=ne2k_pci,name=testNet"));
        assert_eq!(inv.warnings().len(), 1);
    }

    #[test]
    fn other_options_follow_display_and_precede_memory() {
        let mut cfg = base();
        cfg.set_optical_drive("install.iso");
        cfg.set_other_options("  -no-reboot   -rtc base=utc ");
        let inv = cfg.build_invocation().unwrap();
        let args = inv.args();

        let display = args.iter().position(|a| a == "-display").unwrap();
        assert_eq!(&args[display + 2..display + 5], ["-no-reboot", "-rtc", "base=utc"]);
        assert_eq!(&args[args.len() - 2..], ["-m", "512"]);
        assert_eq!(flag_value(&inv, "-cdrom"), Some("install.iso"));
    }
}
