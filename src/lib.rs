//! blast-processing: a QEMU launcher and supervisor.
//!
//! A [`config::Configuration`] describes the machine and turns into an
//! emulator [`config::Invocation`]. [`vm::VmController`] runs that invocation,
//! drives it over QMP, and publishes everything it observes through an
//! [`events::EventDispatcher`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod paths;
pub mod qmp;
pub mod repl;
pub mod snapshot;
pub mod state_machine;
pub mod vm;

pub use config::Configuration;
pub use error::{ControllerError, QmpError, ValidationError};
pub use events::{EventDispatcher, Notification, Subscription};
pub use vm::{ControllerOptions, VmController, VmState};
