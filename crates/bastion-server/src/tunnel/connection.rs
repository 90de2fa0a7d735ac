//! One registered agent connection and the sessions multiplexed over it.
//!
//! Lock discipline:
//! - `writer` (async mutex) serializes every frame written to the transport.
//!   It is the only lock held across an `.await`.
//! - `sessions` (sync mutex) guards the id-indexed session table. It is held
//!   only for map operations and non-blocking channel pushes.
//!
//! The read loop is the single consumer of the transport's inbound half, so
//! frames for a given session id are delivered in arrival order. A full
//! receive channel drops the frame instead of stalling the loop.

use bastion_core::{
    decode_data_frame, encode_data_frame, validate_session_id, AckStatus, BastionError,
    BastionResult, ControlMessage, WireMessage,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::stream::TunnelStream;

/// Outbound half of an agent transport.
pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = BastionError> + Send>>;
/// Inbound half of an agent transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = BastionResult<WireMessage>> + Send>>;

/// A transport split into its two halves.
pub struct AgentTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl AgentTransport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Per-connection tunables.
#[derive(Debug, Clone, Copy)]
pub struct TunnelOptions {
    /// Bound of each session's receive and send channel.
    pub channel_capacity: usize,
    /// How long `create_session` waits for the agent's `forward-ack`.
    pub ack_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a live session. A session absent from the table is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Active,
    Closing,
}

struct SessionEntry {
    target: String,
    state: SessionState,
    recv_tx: Option<mpsc::Sender<Vec<u8>>>,
    ack_tx: Option<oneshot::Sender<Result<(), String>>>,
}

/// The two channels of an established session.
///
/// Dropping `tx` makes the send task emit the session's `close` message.
/// Callers using the raw channels must call
/// [`AgentConnection::close_session`] when done; [`TunnelStream`] does this
/// on drop.
pub struct SessionChannels {
    pub id: String,
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Cleans up a session whose `create_session` did not complete.
///
/// On drop while armed: the entry is removed and, if it was still in the
/// table, a `close` is sent so the agent releases its local connection.
struct PendingSession<'a> {
    conn: &'a Arc<AgentConnection>,
    id: &'a str,
    armed: bool,
}

impl PendingSession<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.conn.remove(self.id) {
            return;
        }
        debug!(agent_id = %self.conn.agent_id, session_id = self.id, "pending session abandoned");
        if self.conn.is_closed() {
            return;
        }
        // Drop cannot await; the close goes out from its own task.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = self.conn.clone();
        let id = self.id.to_string();
        runtime.spawn(async move {
            if let Err(e) = conn.send_control(&ControlMessage::close(&id)).await {
                trace!(agent_id = %conn.agent_id, session_id = %id, error = %e, "close not sent");
            }
        });
    }
}

pub struct AgentConnection {
    agent_id: String,
    conn_id: u64,
    connected_at: chrono::DateTime<chrono::Utc>,
    options: TunnelOptions,
    writer: tokio::sync::Mutex<FrameSink>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_session: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl AgentConnection {
    /// Wrap `transport` and start its read loop.
    ///
    /// The returned handle completes once the loop has exited and every
    /// hosted session has been closed.
    pub fn start(
        agent_id: impl Into<String>,
        conn_id: u64,
        transport: AgentTransport,
        options: TunnelOptions,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let conn = Arc::new(Self {
            agent_id: agent_id.into(),
            conn_id,
            connected_at: chrono::Utc::now(),
            options,
            writer: tokio::sync::Mutex::new(transport.sink),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let handle = tokio::spawn(conn.clone().read_loop(transport.stream));
        (conn, handle)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.table().len()
    }

    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        self.table().get(id).map(|entry| entry.state)
    }

    /// Allocate a session id unique for the lifetime of this connection.
    pub fn next_session_id(&self) -> String {
        format!("s{}", self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_frame(&self, msg: WireMessage) -> BastionResult<()> {
        if self.is_closed() {
            return Err(BastionError::Tunnel(format!(
                "agent '{}' connection is closed",
                self.agent_id
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.send(msg).await
    }

    async fn send_control(&self, msg: &ControlMessage) -> BastionResult<()> {
        self.send_frame(WireMessage::control(msg)?).await
    }

    /// Open session `id` to `target` through the agent.
    ///
    /// Registers the receive channel, sends `forward` and waits for the
    /// agent's `forward-ack`. Every failure leaves no mapping behind.
    pub async fn create_session(
        self: &Arc<Self>,
        id: &str,
        target: &str,
    ) -> BastionResult<SessionChannels> {
        validate_session_id(id)?;
        if self.is_closed() {
            return Err(BastionError::Tunnel(format!(
                "agent '{}' connection is closed",
                self.agent_id
            )));
        }

        let capacity = self.options.channel_capacity;
        let (recv_tx, recv_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut table = self.table();
            if table.contains_key(id) {
                return Err(BastionError::Tunnel(format!(
                    "session '{id}' already exists on agent '{}'",
                    self.agent_id
                )));
            }
            table.insert(
                id.to_string(),
                SessionEntry {
                    target: target.to_string(),
                    state: SessionState::Pending,
                    recv_tx: Some(recv_tx),
                    ack_tx: Some(ack_tx),
                },
            );
        }

        // From here on, any exit short of success (including the caller
        // dropping this future) removes the mapping and closes the id.
        let guard = PendingSession {
            conn: self,
            id,
            armed: true,
        };

        if let Err(e) = self.send_control(&ControlMessage::forward(id, target)).await {
            return Err(BastionError::Tunnel(format!("sending forward failed: {e}")));
        }
        debug!(agent_id = %self.agent_id, session_id = id, target, "forward sent");

        let ack = tokio::time::timeout(self.options.ack_timeout, ack_rx).await;
        match ack {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                return Err(BastionError::Tunnel(format!(
                    "agent '{}' rejected forward to {target}: {reason}",
                    self.agent_id
                )));
            }
            Ok(Err(_)) => {
                return Err(BastionError::Tunnel(format!(
                    "agent '{}' disconnected before acknowledging {id}",
                    self.agent_id
                )));
            }
            Err(_) => {
                return Err(BastionError::Tunnel(format!(
                    "agent '{}' did not acknowledge {id} within {:?}",
                    self.agent_id, self.options.ack_timeout
                )));
            }
        }
        guard.disarm();

        let (send_tx, send_rx) = mpsc::channel(capacity);
        tokio::spawn(self.clone().pump_session(id.to_string(), send_rx));
        info!(agent_id = %self.agent_id, session_id = id, target, "tunnel session active");

        Ok(SessionChannels {
            id: id.to_string(),
            rx: recv_rx,
            tx: send_tx,
        })
    }

    /// Open a session under a freshly allocated id, wrapped as a byte stream.
    pub async fn open_stream(self: &Arc<Self>, target: &str) -> BastionResult<TunnelStream> {
        let id = self.next_session_id();
        let channels = self.create_session(&id, target).await?;
        Ok(TunnelStream::new(self.clone(), channels))
    }

    /// Drop the receive-channel mapping for `id`. Idempotent.
    pub fn close_session(&self, id: &str) {
        let state = self.session_state(id);
        if self.remove(id) {
            debug!(agent_id = %self.agent_id, session_id = id, state = ?state, "tunnel session closed");
        }
    }

    fn remove(&self, id: &str) -> bool {
        self.table().remove(id).is_some()
    }

    /// Drains the send channel into binary frames, then emits one `close`.
    async fn pump_session(self: Arc<Self>, id: String, mut send_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(chunk) = send_rx.recv().await {
            let frame = encode_data_frame(&id, &chunk);
            if let Err(e) = self.send_frame(WireMessage::Binary(frame)).await {
                debug!(agent_id = %self.agent_id, session_id = %id, error = %e, "tunnel write failed");
                break;
            }
        }
        if let Some(entry) = self.table().get_mut(&id) {
            entry.state = SessionState::Closing;
        }
        // Stop accepting chunks before the close goes out.
        send_rx.close();
        if let Err(e) = self.send_control(&ControlMessage::close(&id)).await {
            trace!(agent_id = %self.agent_id, session_id = %id, error = %e, "close not sent");
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream) {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = self.shutdown.notified() => break,
            };
            match next {
                Some(Ok(WireMessage::Text(text))) => self.handle_control(&text),
                Some(Ok(WireMessage::Binary(frame))) => self.handle_data(&frame),
                Some(Err(e)) => {
                    warn!(agent_id = %self.agent_id, error = %e, "agent transport read failed");
                    break;
                }
                None => {
                    info!(agent_id = %self.agent_id, "agent transport closed");
                    break;
                }
            }
        }
        self.close_all();
    }

    fn handle_control(&self, text: &str) {
        let msg = match ControlMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "dropping control frame");
                return;
            }
        };
        match msg {
            ControlMessage::ForwardAck { id, status, error } => {
                let mut table = self.table();
                let Some(entry) = table.get_mut(&id) else {
                    debug!(agent_id = %self.agent_id, session_id = %id, "ack for unknown session");
                    return;
                };
                let Some(ack_tx) = entry.ack_tx.take() else {
                    debug!(agent_id = %self.agent_id, session_id = %id, "duplicate ack ignored");
                    return;
                };
                match status {
                    AckStatus::Ok => {
                        entry.state = SessionState::Active;
                        let _ = ack_tx.send(Ok(()));
                    }
                    AckStatus::Error => {
                        let reason = error.unwrap_or_else(|| "unspecified error".to_string());
                        warn!(
                            agent_id = %self.agent_id,
                            session_id = %id,
                            target = %entry.target,
                            reason = %reason,
                            "agent rejected forward"
                        );
                        table.remove(&id);
                        let _ = ack_tx.send(Err(reason));
                    }
                }
            }
            ControlMessage::ForwardClose { id } | ControlMessage::Close { id } => {
                // Dropping the sender ends the stream for the reader; the
                // mapping itself goes away in close_session.
                if let Some(entry) = self.table().get_mut(&id) {
                    entry.state = SessionState::Closing;
                    entry.recv_tx = None;
                    debug!(agent_id = %self.agent_id, session_id = %id, "agent closed session");
                }
            }
            ControlMessage::Forward { id, .. } => {
                warn!(agent_id = %self.agent_id, session_id = %id, "unexpected forward from agent");
            }
        }
    }

    fn handle_data(&self, frame: &[u8]) {
        let Some((id, payload)) = decode_data_frame(frame) else {
            trace!(agent_id = %self.agent_id, len = frame.len(), "dropping malformed data frame");
            return;
        };
        let table = self.table();
        let Some(recv_tx) = table.get(id).and_then(|entry| entry.recv_tx.as_ref()) else {
            trace!(agent_id = %self.agent_id, session_id = id, "dropping frame for unknown session");
            return;
        };
        match recv_tx.try_send(payload.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(agent_id = %self.agent_id, session_id = id, "receive channel full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(agent_id = %self.agent_id, session_id = id, "receiver gone, frame dropped");
            }
        }
    }

    /// Close every hosted session. Each receive channel is closed once:
    /// entries are moved out of the table before their senders drop.
    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<(String, SessionEntry)> = self.table().drain().collect();
        if !drained.is_empty() {
            info!(
                agent_id = %self.agent_id,
                sessions = drained.len(),
                "closing sessions of disconnected agent"
            );
        }
        drop(drained);
    }

    /// Stop the read loop, close every session and close the transport.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        self.close_all();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!(agent_id = %self.agent_id, error = %e, "transport close failed");
        }
    }
}
