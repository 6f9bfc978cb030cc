//! QMP wire types.
//!
//! QMP is newline-delimited JSON. The server greets first, then every line is
//! one of: a command reply (`return` or `error`), or an asynchronous `event`.
//! Lines are told apart by shape alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Command sent right after the greeting to leave capabilities mode.
pub const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

/// An outbound command.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub id: u64,
}

impl Request<'_> {
    /// Serialized form including the trailing newline.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// The `QMP` object sent by the server on connect.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreetingBody {
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<serde_json::Value>,
}

impl Greeting {
    /// `major.minor.micro` of the emulator, when the greeting carries it.
    pub fn version_string(&self) -> Option<String> {
        let qemu = self.qmp.version.get("qemu")?;
        Some(format!(
            "{}.{}.{}",
            qemu.get("major")?.as_u64()?,
            qemu.get("minor")?.as_u64()?,
            qemu.get("micro")?.as_u64()?
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorBody {
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EventTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

impl EventTimestamp {
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.microseconds.checked_mul(1_000)?).ok()?;
        DateTime::from_timestamp(self.seconds, nanos)
    }
}

/// One inbound line, classified by shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Event {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
        timestamp: Option<EventTimestamp>,
    },
    Return {
        #[serde(rename = "return")]
        value: serde_json::Value,
        id: Option<u64>,
    },
    Error {
        error: ErrorBody,
        id: Option<u64>,
    },
    Greeting {
        #[serde(rename = "QMP")]
        body: serde_json::Value,
    },
}

impl Inbound {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Correlation id of a reply; `None` for events and greetings.
    pub fn reply_id(&self) -> Option<u64> {
        match self {
            Inbound::Return { id, .. } | Inbound::Error { id, .. } => *id,
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Inbound::Return { .. } | Inbound::Error { .. })
    }
}
