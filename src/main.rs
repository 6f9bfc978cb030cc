//! blast-processing: QEMU launcher
//!
//! Edits a persisted VM configuration, shows the emulator command line it
//! produces, and runs the emulator under supervision with a line-oriented
//! control console on stdin.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use blast_processing::config::{self, Configuration};
use blast_processing::logging;
use blast_processing::paths::BlastPaths;
use blast_processing::repl::{self, ReplCommand};
use blast_processing::vm::{ControllerOptions, Operation, VmController, VmState};

/// Launch, configure and supervise QEMU
#[derive(Parser, Debug)]
#[command(name = "blast-processing", version, about = "Launch, configure and supervise QEMU")]
struct Cli {
    /// VM configuration file (defaults to ~/.config/blast-processing/vm.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Change fields of the configuration file
    Set(ConfigEdits),
    /// Validate the configuration and print the emulator command line
    Check,
    /// List the processor, network adapter, VGA and memory choices
    Options,
    /// Start the emulator and read control commands from stdin
    Run {
        /// Controller timeouts (defaults to ~/.config/blast-processing/controller.toml)
        #[arg(long)]
        controller: Option<PathBuf>,
        /// Start even when the configuration produced warnings
        #[arg(long)]
        accept_warnings: bool,
    },
}

#[derive(Args, Debug, Default)]
struct ConfigEdits {
    /// Processor architecture, e.g. x86_64
    #[arg(long)]
    cpu: Option<String>,
    /// Number of CPU cores
    #[arg(long)]
    cpus: Option<u32>,
    /// Network adapter model
    #[arg(long)]
    nic: Option<String>,
    /// VGA card type
    #[arg(long)]
    vga: Option<String>,
    /// Display backend
    #[arg(long)]
    display: Option<String>,
    /// Memory in megabytes
    #[arg(long)]
    memory: Option<u32>,
    /// QMP port; the monitor uses the next one
    #[arg(long)]
    port: Option<u16>,
    /// Expose the human monitor console
    #[arg(long)]
    monitor: Option<bool>,
    /// Extra emulator arguments
    #[arg(long, allow_hyphen_values = true)]
    extra: Option<String>,
    /// First disk image (empty to clear)
    #[arg(long)]
    drive_a: Option<String>,
    /// Treat the first disk image as qcow2
    #[arg(long)]
    qcow2_a: Option<bool>,
    /// Second disk image (empty to clear)
    #[arg(long)]
    drive_b: Option<String>,
    /// Treat the second disk image as qcow2
    #[arg(long)]
    qcow2_b: Option<bool>,
    /// Optical drive image (empty to clear)
    #[arg(long)]
    cdrom: Option<String>,
}

impl ConfigEdits {
    fn apply(self, config: &mut Configuration) {
        if let Some(cpu) = self.cpu {
            config.set_processor_type(cpu);
        }
        if let Some(cpus) = self.cpus {
            config.set_cpu_count(cpus);
        }
        if let Some(nic) = self.nic {
            config.set_network_adapter(nic);
        }
        if let Some(vga) = self.vga {
            config.set_vga_type(vga);
        }
        if let Some(display) = self.display {
            config.set_display(display);
        }
        if let Some(memory) = self.memory {
            config.set_memory_mb(memory);
        }
        if let Some(port) = self.port {
            config.set_starting_port(port);
        }
        if let Some(monitor) = self.monitor {
            config.enable_human_interface(monitor);
        }
        if let Some(extra) = self.extra {
            config.set_other_options(extra);
        }

        let (path_a, qcow2_a) = current_drive(config.drive_a());
        if self.drive_a.is_some() || self.qcow2_a.is_some() {
            config.set_drive_a(
                self.drive_a.unwrap_or(path_a),
                self.qcow2_a.unwrap_or(qcow2_a),
            );
        }
        let (path_b, qcow2_b) = current_drive(config.drive_b());
        if self.drive_b.is_some() || self.qcow2_b.is_some() {
            config.set_drive_b(
                self.drive_b.unwrap_or(path_b),
                self.qcow2_b.unwrap_or(qcow2_b),
            );
        }
        if let Some(cdrom) = self.cdrom {
            config.set_optical_drive(cdrom);
        }
    }
}

fn current_drive(drive: Option<&config::Drive>) -> (String, bool) {
    drive
        .map(|d| (d.path.clone(), d.qcow2))
        .unwrap_or_default()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init();

    let paths = BlastPaths::resolve();
    let config_path = match (&cli.config, &paths) {
        (Some(path), _) => path.clone(),
        (None, Some(paths)) => paths.vm_config(),
        (None, None) => bail!("HOME is not set; pass --config"),
    };

    match cli.command {
        Command::Init { force } => init(&config_path, force),
        Command::Set(edits) => {
            let mut config = Configuration::load(&config_path)?;
            edits.apply(&mut config);
            config.save(&config_path)?;
            println!("Updated {}", config_path.display());
            Ok(())
        }
        Command::Check => check(&config_path),
        Command::Options => {
            print_options();
            Ok(())
        }
        Command::Run {
            controller,
            accept_warnings,
        } => {
            let controller_path =
                controller.or_else(|| paths.as_ref().map(|p| p.controller_config()));
            let options = match controller_path {
                Some(path) if path.exists() => ControllerOptions::load(&path)?,
                _ => ControllerOptions::default(),
            };
            let config = Configuration::load(&config_path)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to create Tokio runtime")?;
            runtime.block_on(run(config, options, accept_warnings, paths))
        }
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Configuration::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = Configuration::load(path)?;
    let invocation = config
        .build_invocation()
        .with_context(|| format!("{} is not runnable", path.display()))?;
    println!("{invocation}");
    for warning in invocation.warnings() {
        println!("warning: {warning}");
    }
    Ok(())
}

fn print_options() {
    println!("Processor types:");
    println!("  {}", config::processor_types().join(" "));
    println!("Network adapters:");
    println!("  {}", config::network_adapter_types().join(" "));
    println!("VGA types:");
    println!("  {}", config::vga_types().join(" "));
    println!("Memory sizes (MB):");
    let sizes: Vec<String> = config::memory_sizes().iter().map(u32::to_string).collect();
    println!("  {}", sizes.join(" "));
}

async fn run(
    config: Configuration,
    options: ControllerOptions,
    accept_warnings: bool,
    paths: Option<BlastPaths>,
) -> Result<()> {
    let preview = config.build_invocation()?;
    if !preview.warnings().is_empty() && !accept_warnings {
        for warning in preview.warnings() {
            eprintln!("warning: {warning}");
        }
        bail!("configuration has warnings; re-run with --accept-warnings to start anyway");
    }

    let vm = VmController::new(options);
    let mut notifications = vm.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode notification"),
            }
        }
    });

    let invocation = vm.start(&config).await?;
    info!(command = %invocation, "emulator started");
    eprintln!("Type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match repl::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };
        if command == ReplCommand::Quit {
            break;
        }
        if let Err(e) = execute(&vm, command, paths.as_ref()).await {
            eprintln!("error: {e}");
        }
        if matches!(vm.state(), VmState::Stopped) {
            break;
        }
    }

    if vm.state().permits(Operation::Stop) {
        vm.stop().await?;
    }
    // The printer ends once the last publisher is gone, after the final
    // state change has been printed.
    drop(vm);
    if printer.await.is_err() {
        warn!("notification printer panicked");
    }
    Ok(())
}

async fn execute(
    vm: &VmController,
    command: ReplCommand,
    paths: Option<&BlastPaths>,
) -> Result<()> {
    match command {
        ReplCommand::Help => {
            for (usage, description) in repl::HELP {
                eprintln!("  {usage:<22} {description}");
            }
        }
        ReplCommand::Status => {
            let status = vm.query_status().await?;
            eprintln!("{} ({})", status.status, vm.state());
        }
        ReplCommand::Pause => vm.pause().await?,
        ReplCommand::Continue => vm.resume().await?,
        ReplCommand::Reset => vm.reset().await?,
        ReplCommand::Stop => vm.stop().await?,
        ReplCommand::PowerOff => vm.power_off().await?,
        ReplCommand::Save(name) => vm.save_snapshot(&name).await?,
        ReplCommand::Load(name) => vm.load_snapshot(&name).await?,
        ReplCommand::Screendump(path) => {
            let path = match path {
                Some(path) => path,
                None => default_screendump_path(paths)?,
            };
            vm.screendump(&path).await?;
            eprintln!("Wrote {}", path.display());
        }
        ReplCommand::Hmp(command_line) => {
            let output = vm.human_command(&command_line).await?;
            if !output.is_empty() {
                eprint!("{output}");
            }
        }
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn default_screendump_path(paths: Option<&BlastPaths>) -> Result<PathBuf> {
    let Some(paths) = paths else {
        bail!("HOME is not set; pass a screendump path");
    };
    paths.ensure()?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(paths.screendumps.join(format!("screen-{stamp}.ppm")))
}
