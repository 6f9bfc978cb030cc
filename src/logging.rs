//! Logging initialisation for blast-processing.
//!
//! When the `BLAST_LOG` environment variable is set to `1`, structured
//! logs are also written to `blast.log` in the log directory from
//! [`crate::paths`]. Otherwise only stderr output (filtered by `RUST_LOG`)
//! is enabled.
//!
//! Emulator stderr is logged at `info` under the [`QEMU_TARGET`] target. The
//! default filter lets it through even when the crate itself only reports
//! warnings; `RUST_LOG=qemu=off` silences it.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::BlastPaths;

pub const LOG_ENV: &str = "BLAST_LOG";
pub const LOG_FILE: &str = "blast.log";

/// Target for lines the emulator writes to its stderr.
pub const QEMU_TARGET: &str = "qemu";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let file_guard = if std::env::var(LOG_ENV).as_deref() == Ok("1") {
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter("info"))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter("warn"))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

/// `RUST_LOG` if set, else `level` for everything but emulator output.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: &str) -> String {
    format!("{level},{QEMU_TARGET}=info")
}

fn log_dir() -> PathBuf {
    BlastPaths::resolve()
        .map(|paths| paths.logs)
        .unwrap_or_else(|| std::env::temp_dir().join("blast-processing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_keeps_emulator_output() {
        let directives = default_directives("warn");
        assert_eq!(directives, "warn,qemu=info");
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
