//! Tunnel control messages.
//!
//! Control messages travel as JSON text frames on an agent connection:
//!
//! ```text
//! bastion -> agent: {"type":"forward","id":"<sid>","target":"127.0.0.1:22"}
//! bastion -> agent: {"type":"close","id":"<sid>"}
//! agent -> bastion: {"type":"forward-ack","id":"<sid>","status":"ok"}
//! agent -> bastion: {"type":"forward-ack","id":"<sid>","status":"error","error":"..."}
//! agent -> bastion: {"type":"forward-close","id":"<sid>"}
//! ```
//!
//! Data travels as binary frames, see [`crate::codec`].

use crate::error::{BastionError, BastionResult};
use serde::{Deserialize, Serialize};

/// Outcome carried by a `forward-ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// The four control message kinds exchanged over an agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Bastion asks the agent to open `target` under session `id`.
    Forward { id: String, target: String },
    /// Agent reports the result of a `forward`.
    ForwardAck {
        id: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Either side terminates session `id`.
    Close { id: String },
    /// Agent's local stream for `id` reached end-of-stream.
    ForwardClose { id: String },
}

impl ControlMessage {
    pub fn forward(id: impl Into<String>, target: impl Into<String>) -> Self {
        ControlMessage::Forward {
            id: id.into(),
            target: target.into(),
        }
    }

    pub fn ack_ok(id: impl Into<String>) -> Self {
        ControlMessage::ForwardAck {
            id: id.into(),
            status: AckStatus::Ok,
            error: None,
        }
    }

    pub fn ack_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        ControlMessage::ForwardAck {
            id: id.into(),
            status: AckStatus::Error,
            error: Some(error.into()),
        }
    }

    pub fn close(id: impl Into<String>) -> Self {
        ControlMessage::Close { id: id.into() }
    }

    pub fn forward_close(id: impl Into<String>) -> Self {
        ControlMessage::ForwardClose { id: id.into() }
    }

    /// Session id this message refers to.
    pub fn id(&self) -> &str {
        match self {
            ControlMessage::Forward { id, .. }
            | ControlMessage::ForwardAck { id, .. }
            | ControlMessage::Close { id }
            | ControlMessage::ForwardClose { id } => id,
        }
    }

    /// Serialize to the JSON text carried by a text frame.
    pub fn encode(&self) -> BastionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Unknown types and missing fields are protocol errors.
    pub fn decode(text: &str) -> BastionResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| BastionError::Protocol(format!("malformed control frame: {e}")))
    }
}

/// One unit on an agent connection, independent of the carrying transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A JSON control message.
    Text(String),
    /// An id-prefixed data frame.
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn control(msg: &ControlMessage) -> BastionResult<Self> {
        Ok(WireMessage::Text(msg.encode()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_wire_shape() {
        let json = ControlMessage::forward("s1", "127.0.0.1:22").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "forward");
        assert_eq!(value["id"], "s1");
        assert_eq!(value["target"], "127.0.0.1:22");
    }

    #[test]
    fn ack_ok_omits_error_field() {
        let json = ControlMessage::ack_ok("s1").encode().unwrap();
        assert_eq!(json, r#"{"type":"forward-ack","id":"s1","status":"ok"}"#);
    }

    #[test]
    fn decodes_agent_error_ack() {
        let msg = ControlMessage::decode(
            r#"{"type":"forward-ack","id":"s1","status":"error","error":"connection refused"}"#,
        )
        .unwrap();
        assert_eq!(msg, ControlMessage::ack_error("s1", "connection refused"));
    }

    #[test]
    fn decodes_forward_close() {
        let msg = ControlMessage::decode(r#"{"type":"forward-close","id":"abc"}"#).unwrap();
        assert_eq!(msg.id(), "abc");
        assert!(matches!(msg, ControlMessage::ForwardClose { .. }));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = ControlMessage::decode(r#"{"type":"bogus","id":"s1"}"#).unwrap_err();
        assert!(matches!(err, BastionError::Protocol(_)));
    }

    #[test]
    fn rejects_missing_id() {
        assert!(ControlMessage::decode(r#"{"type":"close"}"#).is_err());
    }
}
