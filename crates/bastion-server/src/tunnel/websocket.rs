//! Adapts an upgraded axum WebSocket into an [`AgentTransport`].

use axum::extract::ws::{Message, WebSocket};
use bastion_core::{BastionError, BastionResult, WireMessage};
use futures_util::{future, SinkExt, StreamExt};

use super::connection::AgentTransport;

/// Maximum frame size accepted from an agent (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Split `socket` into the frame sink/stream pair an agent connection reads
/// and writes. Ping, pong and close frames are handled by axum and never
/// surface as wire messages.
pub fn agent_transport(socket: WebSocket) -> AgentTransport {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| BastionError::Transport(format!("websocket send failed: {e}")))
        .with(|msg: WireMessage| future::ready(Ok::<_, BastionError>(to_ws(msg))));
    let stream = stream.filter_map(|msg| future::ready(from_ws(msg)));
    AgentTransport::new(Box::pin(sink), Box::pin(stream))
}

fn to_ws(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(data) => Message::Binary(data.into()),
    }
}

fn from_ws(msg: Result<Message, axum::Error>) -> Option<BastionResult<WireMessage>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => {
            if data.len() > MAX_WS_FRAME_SIZE {
                return Some(Err(BastionError::Protocol(format!(
                    "WS frame too large: {} bytes (max {})",
                    data.len(),
                    MAX_WS_FRAME_SIZE
                ))));
            }
            Some(Ok(WireMessage::Binary(data.to_vec())))
        }
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Close(_)) => None,
        Err(e) => Some(Err(BastionError::Transport(format!(
            "websocket recv failed: {e}"
        )))),
    }
}
