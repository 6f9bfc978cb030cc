//! Error types for blast-processing.
//!
//! Configuration problems ([`ValidationError`]) block building an invocation.
//! Runtime problems are split between the QMP transport ([`QmpError`]) and the
//! lifecycle controller ([`ControllerError`]), which wraps the former.

use std::path::PathBuf;

use thiserror::Error;

use crate::vm::VmState;

/// A configuration that cannot be turned into an emulator invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a CPU type must be specified before starting the emulator")]
    MissingCpuType,

    #[error("at least 1 CPU core must be specified")]
    NoCpus,

    #[error("drive B is set ({0}) but drive A is empty")]
    DriveBWithoutDriveA(String),

    #[error("starting port {0} leaves no room for the monitor port")]
    PortOutOfRange(u16),
}

/// Failures on the QMP connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QmpError {
    #[error("QMP I/O error: {0}")]
    Io(String),

    #[error("QMP protocol error: {0}")]
    Protocol(String),

    #[error("QMP command `{command}` failed: {class}: {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    #[error("QMP capabilities have not been negotiated")]
    NotNegotiated,

    #[error("QMP command `{0}` timed out after {1:?}")]
    Timeout(String, std::time::Duration),

    #[error("QMP connection lost")]
    ConnectionLost,

    #[error("QMP command `{0}` was cancelled")]
    Cancelled(String),
}

impl From<std::io::Error> for QmpError {
    fn from(e: std::io::Error) -> Self {
        QmpError::Io(e.to_string())
    }
}

/// Failures reported by [`crate::vm::VmController`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("`{operation}` is not allowed while the emulator is {state}")]
    InvalidState {
        operation: &'static str,
        state: VmState,
    },

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("emulator did not complete the QMP handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Qmp(#[from] QmpError),

    #[error("invalid snapshot name {0:?}")]
    InvalidSnapshotName(String),

    #[error("snapshot `{name}` failed: {reason}")]
    Snapshot { name: String, reason: String },
}

/// Failures saving or loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
