//! QMP wire types.
//!
//! Only what the handshake, command responses and the event feed need.
//! Payloads stay as [`serde_json::Value`] so newer QEMU fields pass through.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First message QEMU sends on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// `QMP` section.
    #[serde(rename = "QMP")]
    pub qmp: QmpInfo,
}

/// `QMP` section of the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Server version.
    pub version: QmpVersion,

    /// Capabilities the server offers for negotiation.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// QEMU version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// Numeric version.
    pub qemu: QmpVersionNumber,

    /// Distribution package string, often empty.
    #[serde(default)]
    pub package: String,
}

/// Numeric QEMU version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersionNumber {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}

/// The `error` object of a failed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpError {
    /// Error class (`GenericError`, `DeviceNotActive`, ...).
    pub class: String,
    /// Human readable description.
    pub desc: String,
}

/// Response to an `execute`: either `return` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmpResponse {
    /// Request id echoed by the server.
    pub id: Value,

    /// Success payload.
    #[serde(rename = "return", default)]
    pub result: Option<Value>,

    /// Error payload.
    #[serde(default)]
    pub error: Option<QmpError>,
}

/// Event timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,
    /// Microseconds within the second.
    pub microseconds: i64,
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `BLOCK_JOB_COMPLETED`.
    pub name: String,

    /// Event payload; block job events carry `device` here.
    #[serde(default)]
    pub data: Value,

    /// When QEMU emitted the event.
    pub timestamp: Option<Timestamp>,
}

/// An event as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name.
    #[serde(rename = "event")]
    pub name: String,

    /// Event payload.
    #[serde(default)]
    pub data: Value,

    /// Timestamp.
    pub timestamp: Option<Timestamp>,
}

impl From<EventMessage> for Event {
    fn from(msg: EventMessage) -> Self {
        Self {
            name: msg.name,
            data: msg.data,
            timestamp: msg.timestamp,
        }
    }
}
