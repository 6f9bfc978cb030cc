//! QMP, the emulator's JSON machine protocol.
//!
//! [`protocol`] holds the wire types; [`channel`] is the client that owns a
//! connection, negotiates capabilities and serializes commands.

pub mod channel;
pub mod protocol;

pub use channel::{CloseReason, QmpChannel};
