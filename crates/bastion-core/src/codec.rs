//! Binary data frames for the tunnel.
//!
//! Wire format: `<session id>` `|` `<raw payload>`
//!
//! The delimiter must never appear inside a session id; the receiver splits
//! on the first `|`, so payloads may contain it freely.

use crate::error::{BastionError, BastionResult};

/// Separator between the session id and the payload.
pub const FRAME_DELIMITER: u8 = b'|';

/// Check that `id` can be used as a session id on the wire.
pub fn validate_session_id(id: &str) -> BastionResult<()> {
    if id.is_empty() {
        return Err(BastionError::Tunnel("session id must not be empty".into()));
    }
    if id.as_bytes().contains(&FRAME_DELIMITER) {
        return Err(BastionError::Tunnel(format!(
            "session id '{id}' contains the frame delimiter"
        )));
    }
    Ok(())
}

/// Build a data frame tagged with `id`.
pub fn encode_data_frame(id: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(id.len() + 1 + payload.len());
    frame.extend_from_slice(id.as_bytes());
    frame.push(FRAME_DELIMITER);
    frame.extend_from_slice(payload);
    frame
}

/// Split a data frame into `(id, payload)`.
///
/// Returns `None` for frames the receiver must drop: no delimiter, an empty
/// id, or an id that is not UTF-8.
pub fn decode_data_frame(frame: &[u8]) -> Option<(&str, &[u8])> {
    let idx = frame.iter().position(|&b| b == FRAME_DELIMITER)?;
    if idx == 0 {
        return None;
    }
    let id = std::str::from_utf8(&frame[..idx]).ok()?;
    Some((id, &frame[idx + 1..]))
}
