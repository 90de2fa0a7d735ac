//! WebSocket connection to the bastion's registration endpoint.

use bastion_core::{BastionError, BastionResult, WireMessage};
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::info;

use crate::tunnel::{FrameSink, FrameStream};

/// Maximum frame size accepted from the bastion (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// `ws://host:port/ws` plus the `agent_id` query parameter.
pub fn registration_url(base: &str, agent_id: &str) -> BastionResult<String> {
    if agent_id.is_empty()
        || !agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(BastionError::Config(format!(
            "agent id '{agent_id}' must be non-empty and use only [A-Za-z0-9._:-]"
        )));
    }
    if !(base.starts_with("ws://") || base.starts_with("wss://")) {
        return Err(BastionError::Config(format!(
            "bastion url '{base}' must start with ws:// or wss://"
        )));
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{separator}agent_id={agent_id}"))
}

/// Connect and split into the frame sink/stream pair the tunnel serves.
pub async fn connect(url: &str) -> BastionResult<(FrameSink, FrameStream)> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| BastionError::Transport(format!("WebSocket connect error: {e}")))?;
    info!(url, "connected to bastion");

    let (sink, stream) = ws.split();
    let sink = sink
        .sink_map_err(|e| BastionError::Transport(format!("WebSocket send failed: {e}")))
        .with(|msg: WireMessage| future::ready(Ok::<_, BastionError>(to_ws(msg))));
    let stream = stream.filter_map(|msg| future::ready(from_ws(msg)));
    Ok((Box::pin(sink), Box::pin(stream)))
}

fn to_ws(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(data) => Message::Binary(data),
    }
}

fn from_ws(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<BastionResult<WireMessage>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
        Ok(Message::Binary(data)) => {
            if data.len() > MAX_WS_FRAME_SIZE {
                return Some(Err(BastionError::Protocol(format!(
                    "WS frame too large: {} bytes (max {})",
                    data.len(),
                    MAX_WS_FRAME_SIZE
                ))));
            }
            Some(Ok(WireMessage::Binary(data)))
        }
        // Ping, pong and close are answered by tungstenite itself.
        Ok(_) => None,
        Err(e) => Some(Err(BastionError::Transport(format!(
            "WebSocket recv failed: {e}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_url_appends_agent_id() {
        assert_eq!(
            registration_url("ws://bastion:8080/ws", "agentA").unwrap(),
            "ws://bastion:8080/ws?agent_id=agentA"
        );
        assert_eq!(
            registration_url("wss://bastion/ws?v=1", "dc1-agent").unwrap(),
            "wss://bastion/ws?v=1&agent_id=dc1-agent"
        );
    }

    #[test]
    fn registration_url_rejects_bad_input() {
        assert!(registration_url("ws://bastion/ws", "").is_err());
        assert!(registration_url("ws://bastion/ws", "a&b").is_err());
        assert!(registration_url("http://bastion/ws", "agentA").is_err());
    }

    #[test]
    fn frames_map_both_ways() {
        assert!(matches!(to_ws(WireMessage::Text("{}".into())), Message::Text(_)));
        let back = from_ws(Ok(Message::Binary(b"s1|x".to_vec()))).unwrap().unwrap();
        assert_eq!(back, WireMessage::Binary(b"s1|x".to_vec()));
        assert!(from_ws(Ok(Message::Ping(vec![1]))).is_none());
        let oversized = from_ws(Ok(Message::Binary(vec![0; MAX_WS_FRAME_SIZE + 1])));
        assert!(matches!(oversized, Some(Err(BastionError::Protocol(_)))));
    }
}
