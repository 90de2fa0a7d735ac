//! Session audit record format.
//!
//! One JSON object per line:
//!
//! ```text
//! {"ts":1718000000123,"type":"meta","v":{"user":"alice","target":"10.0.0.5:22"}}
//! {"ts":1718000000124,"type":"event","v":"session-start"}
//! {"ts":1718000000200,"type":"stdout","v":"bG9naW46IA=="}
//! ```
//!
//! `ts` is epoch milliseconds; `stdin`/`stdout` payloads are base64.

use crate::error::{BastionError, BastionResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_SESSION_START: &str = "session-start";
pub const EVENT_SESSION_END: &str = "session-end";

/// Record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Meta,
    Event,
    Stdin,
    Stdout,
    Resize,
}

/// A single audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub v: Value,
}

impl AuditRecord {
    pub fn now(kind: AuditKind, v: Value) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            kind,
            v,
        }
    }

    /// A `stdin`/`stdout` record with a base64 payload.
    pub fn bytes(kind: AuditKind, data: &[u8]) -> Self {
        Self::now(kind, Value::String(STANDARD.encode(data)))
    }

    pub fn event(name: &str) -> Self {
        Self::now(AuditKind::Event, Value::String(name.to_string()))
    }

    pub fn resize(cols: u32, rows: u32) -> Self {
        Self::now(AuditKind::Resize, serde_json::json!({ "cols": cols, "rows": rows }))
    }

    /// Serialize as one line, without the trailing newline.
    pub fn to_line(&self) -> BastionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse_line(line: &str) -> BastionResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Decode the payload of a `stdin`/`stdout` record.
    pub fn decode_bytes(&self) -> BastionResult<Vec<u8>> {
        let encoded = self
            .v
            .as_str()
            .ok_or_else(|| BastionError::Protocol("byte record payload is not a string".into()))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| BastionError::Protocol(format!("invalid base64 payload: {e}")))
    }
}
