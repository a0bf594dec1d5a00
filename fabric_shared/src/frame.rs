//! Message frames.
//!
//! One frame is one logical message on the wire:
//! `{"id": …, "command": …, "data": …, "delivery": …}` with `null` for absent
//! fields. `data` carries any JSON value; the other three are strings or null.
//!
//! The encoder is a single function over a frame value; the constructor
//! variants cover the shapes the call sites need (`data` only, `command` +
//! `data`, addressed, and fully specified).

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

/// Error codes carried in `data` when `command == "error"`.
pub mod codes {
    /// Message not parseable as JSON.
    pub const NOT_JSON: i64 = 101;
    /// Message parsed but not a JSON array of frames.
    pub const NOT_ARRAY: i64 = 102;
    /// Client name already taken on this domain.
    pub const NAME_TAKEN: i64 = 201;
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    /// Handshake replies: the target client's friendly name. Relay envelopes:
    /// the originator's friendly name. Null when unused.
    pub id: Option<String>,
    /// Application command name, or one of the reserved names.
    pub command: Option<String>,
    /// Application payload; for relay control messages, an inner serialized frame.
    pub data: Value,
    /// Correlation id requesting a reply and matching the later reply frame.
    pub delivery: Option<String>,
}

impl Frame {
    /// Frame carrying only a payload.
    pub fn data(data: Value) -> Self {
        Self {
            id: None,
            command: None,
            data,
            delivery: None,
        }
    }

    /// Frame carrying a command and payload.
    pub fn command(command: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            command: Some(command.into()),
            data,
            delivery: None,
        }
    }

    /// Frame addressed to (or identifying) a named peer.
    pub fn addressed(id: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            command: Some(command.into()),
            data,
            delivery: None,
        }
    }

    /// Fully specified frame.
    pub fn full(
        id: Option<String>,
        command: Option<String>,
        data: Value,
        delivery: Option<String>,
    ) -> Self {
        Self {
            id,
            command,
            data,
            delivery,
        }
    }

    /// Synthetic `error` frame carrying one of the [`codes`].
    pub fn error(code: i64) -> Self {
        Self::command("error", Value::from(code))
    }

    /// Attaches a delivery correlation id.
    pub fn with_delivery(mut self, delivery: impl Into<String>) -> Self {
        self.delivery = Some(delivery.into());
        self
    }

    /// Serializes the frame to its wire bytes (one JSON object, no trailer).
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize frame")
    }

    /// Serializes the frame to a JSON string, for embedding as an inner
    /// envelope payload.
    pub fn encode_string(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize frame")
    }

    /// Normalizes a parsed JSON value into a frame.
    ///
    /// Objects map onto the four fields with missing ones set to null;
    /// any other value becomes the `data` of an otherwise-empty frame.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) => Self {
                id: coerce_string(map.remove("id")),
                command: coerce_string(map.remove("command")),
                data: map.remove("data").unwrap_or(Value::Null),
                delivery: coerce_string(map.remove("delivery")),
            },
            other => Self::data(other),
        }
    }

    /// True when `command` equals `name`.
    pub fn is_command(&self, name: &str) -> bool {
        self.command.as_deref() == Some(name)
    }
}

/// Coerces a scalar JSON value to a string field; null and missing stay null.
fn coerce_string(value: Option<Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(_) => None,
    }
}
