//! Serving one tunnel connection.
//!
//! The bastion sends `forward` to open a session; the agent dials the target
//! locally and answers with `forward-ack`. Bytes then flow as `id|payload`
//! binary frames both ways. Each local connection has a reader task (local
//! to bastion, ending with `forward-close`) and a writer task (bastion to
//! local). Writes to the shared socket are serialized by one mutex.

use bastion_core::pattern::first_match;
use bastion_core::{
    decode_data_frame, encode_data_frame, validate_session_id, BastionError, BastionResult,
    ControlMessage, TargetPattern, WireMessage,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 32 * 1024;

pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = BastionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = BastionResult<WireMessage>> + Send>>;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Targets this agent may dial. Empty allows everything.
    pub allow: Vec<TargetPattern>,
    pub dial_timeout: Duration,
    /// Bound of each session's outbound-to-local queue.
    pub channel_capacity: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            channel_capacity: 100,
        }
    }
}

impl AgentOptions {
    pub fn permits(&self, target: &str) -> bool {
        self.allow.is_empty() || first_match(&self.allow, target).is_some()
    }
}

struct LocalSession {
    tx: mpsc::Sender<Vec<u8>>,
    reader: AbortHandle,
}

enum SessionSlot {
    /// Id reserved while the target is being dialed.
    Dialing,
    Open(LocalSession),
}

type SessionTable = Arc<std::sync::Mutex<HashMap<String, SessionSlot>>>;

/// State of one live tunnel connection.
struct Tunnel {
    sink: Mutex<FrameSink>,
    sessions: SessionTable,
    options: Arc<AgentOptions>,
}

impl Tunnel {
    async fn send(&self, msg: WireMessage) -> BastionResult<()> {
        self.sink.lock().await.send(msg).await
    }

    async fn send_control(&self, msg: ControlMessage) -> BastionResult<()> {
        self.send(WireMessage::control(&msg)?).await
    }

    async fn reject(&self, id: &str, error: String) {
        warn!(session_id = id, error = %error, "forward rejected");
        if let Err(e) = self.send_control(ControlMessage::ack_error(id, error)).await {
            debug!(session_id = id, error = %e, "failed to send forward-ack");
        }
    }

    /// Claim `id` for a dial in progress. False if the id is taken.
    fn reserve(&self, id: &str) -> bool {
        match self.sessions.lock() {
            Ok(mut sessions) if !sessions.contains_key(id) => {
                sessions.insert(id.to_string(), SessionSlot::Dialing);
                true
            }
            _ => false,
        }
    }

    /// Give up a reservation whose dial failed.
    fn release(&self, id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if matches!(sessions.get(id), Some(SessionSlot::Dialing)) {
                sessions.remove(id);
            }
        }
    }

    /// Drop the local connection for `id`. Returns whether it existed.
    fn drop_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().ok().and_then(|mut s| s.remove(id));
        match removed {
            Some(SessionSlot::Open(session)) => {
                session.reader.abort();
                true
            }
            Some(SessionSlot::Dialing) => true,
            None => false,
        }
    }

    fn close_all(&self) -> usize {
        let drained: Vec<SessionSlot> = match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, s)| s).collect(),
            Err(_) => Vec::new(),
        };
        for slot in &drained {
            if let SessionSlot::Open(session) = slot {
                session.reader.abort();
            }
        }
        drained.len()
    }
}

/// Serve the tunnel until the bastion disconnects or the transport fails.
/// Every local connection is closed before returning.
pub async fn serve(sink: FrameSink, mut stream: FrameStream, options: Arc<AgentOptions>) -> BastionResult<()> {
    let tunnel = Arc::new(Tunnel {
        sink: Mutex::new(sink),
        sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
        options,
    });

    let result = loop {
        match stream.next().await {
            Some(Ok(WireMessage::Text(text))) => match ControlMessage::decode(&text) {
                Ok(msg) => handle_control(&tunnel, msg).await,
                Err(e) => warn!(error = %e, "dropping malformed control message"),
            },
            Some(Ok(WireMessage::Binary(frame))) => handle_data(&tunnel, &frame),
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        }
    };

    let closed = tunnel.close_all();
    if closed > 0 {
        info!(sessions = closed, "tunnel ended, local connections closed");
    }
    result
}

async fn handle_control(tunnel: &Arc<Tunnel>, msg: ControlMessage) {
    match msg {
        ControlMessage::Forward { id, target } => {
            if let Err(e) = validate_session_id(&id) {
                tunnel.reject(&id, e.to_string()).await;
                return;
            }
            if !tunnel.options.permits(&target) {
                tunnel
                    .reject(&id, format!("target {target} not allowed by this agent"))
                    .await;
                return;
            }
            if !tunnel.reserve(&id) {
                tunnel.reject(&id, format!("session {id} already open")).await;
                return;
            }
            tokio::spawn(open_session(tunnel.clone(), id, target));
        }
        ControlMessage::Close { id } => {
            if tunnel.drop_session(&id) {
                debug!(session_id = %id, "session closed by bastion");
            }
        }
        other => debug!(message = ?other, "ignoring unexpected control message"),
    }
}

fn handle_data(tunnel: &Tunnel, frame: &[u8]) {
    let Some((id, payload)) = decode_data_frame(frame) else {
        debug!(len = frame.len(), "dropping malformed data frame");
        return;
    };
    let Ok(sessions) = tunnel.sessions.lock() else {
        return;
    };
    match sessions.get(id) {
        Some(SessionSlot::Open(session)) => {
            if session.tx.try_send(payload.to_vec()).is_err() {
                warn!(session_id = id, len = payload.len(), "session queue full, dropping frame");
            }
        }
        Some(SessionSlot::Dialing) => debug!(session_id = id, "data before forward-ack, dropping frame"),
        None => debug!(session_id = id, "data for unknown session"),
    }
}

async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, String> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(format!("dial {target}: {e}")),
        Err(_) => Err(format!("dial {target}: timed out after {timeout:?}")),
    }
}

async fn open_session(tunnel: Arc<Tunnel>, id: String, target: String) {
    let stream = match dial(&target, tunnel.options.dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tunnel.release(&id);
            tunnel.reject(&id, e).await;
            return;
        }
    };
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(tunnel.options.channel_capacity.max(1));
    let (start_tx, start_rx) = oneshot::channel();

    // The session is in the table before the ack goes out, and the reader
    // only starts after it, so `forward-close` can never precede the ack.
    let reader = tokio::spawn(pump_local(tunnel.clone(), id.clone(), read_half, start_rx));
    let installed = match tunnel.sessions.lock() {
        Ok(mut sessions) => match sessions.get_mut(&id) {
            Some(slot) if matches!(slot, SessionSlot::Dialing) => {
                *slot = SessionSlot::Open(LocalSession {
                    tx,
                    reader: reader.abort_handle(),
                });
                true
            }
            _ => false,
        },
        Err(_) => false,
    };
    if !installed {
        // Closed by the bastion (or the tunnel ended) while dialing.
        reader.abort();
        debug!(session_id = %id, "session dropped before it opened");
        return;
    }
    tokio::spawn(write_local(id.clone(), rx, write_half));

    if let Err(e) = tunnel.send_control(ControlMessage::ack_ok(id.clone())).await {
        warn!(session_id = %id, error = %e, "failed to send forward-ack");
        tunnel.drop_session(&id);
        return;
    }
    let _ = start_tx.send(());
    info!(session_id = %id, target = %target, "session opened");
}

/// Local target to bastion. Ends with exactly one `forward-close`.
async fn pump_local(
    tunnel: Arc<Tunnel>,
    id: String,
    mut read_half: OwnedReadHalf,
    start: oneshot::Receiver<()>,
) {
    if start.await.is_err() {
        return;
    }
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(session_id = %id, error = %e, "local read failed");
                break;
            }
        };
        let frame = WireMessage::Binary(encode_data_frame(&id, &buf[..n]));
        if let Err(e) = tunnel.send(frame).await {
            debug!(session_id = %id, error = %e, "tunnel send failed");
            break;
        }
    }
    if let Ok(mut sessions) = tunnel.sessions.lock() {
        sessions.remove(&id);
    }
    let _ = tunnel
        .send_control(ControlMessage::forward_close(id.clone()))
        .await;
    debug!(session_id = %id, "local connection ended");
}

/// Bastion to local target, until the session is dropped.
async fn write_local(id: String, mut rx: mpsc::Receiver<Vec<u8>>, mut write_half: OwnedWriteHalf) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = write_half.write_all(&chunk).await {
            debug!(session_id = %id, error = %e, "local write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
