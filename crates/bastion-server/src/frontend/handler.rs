//! Per-connection russh handler.

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodSet};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::Frontend;
use crate::backend::PtyRequest;
use crate::error::SessionError;
use crate::session::{splice, SessionRecorder, SessionStage};

pub struct SessionHandler {
    frontend: Arc<Frontend>,
    peer: Option<SocketAddr>,
    identity: Option<String>,
    channel: Option<Channel<Msg>>,
    pty: PtyRequest,
    /// Set once the backend is up; window changes are recorded through it.
    recorder: Arc<OnceLock<Arc<SessionRecorder>>>,
    shell_started: bool,
}

impl SessionHandler {
    pub(super) fn new(frontend: Arc<Frontend>, peer: Option<SocketAddr>) -> Self {
        Self {
            frontend,
            peer,
            identity: None,
            channel: None,
            pty: PtyRequest::default(),
            recorder: Arc::new(OnceLock::new()),
            shell_started: false,
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::PUBLICKEY),
        }
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = SessionError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if !self.frontend.auth().allows_none() {
            return Ok(self.reject());
        }
        self.identity = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let key_base64 = public_key.public_key_base64();
        if !self.frontend.auth().allows_key(user, &key_base64) {
            warn!(
                identity = user,
                peer = ?self.peer,
                key = %public_key.fingerprint(),
                "public key not authorized"
            );
            return Ok(self.reject());
        }
        self.identity = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() || self.shell_started {
            debug!(peer = ?self.peer, "refusing second session channel");
            return Ok(false);
        }
        self.channel = Some(channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !term.is_empty() {
            self.pty.term = term.to_string();
        }
        if col_width > 0 && row_height > 0 {
            self.pty.cols = col_width;
            self.pty.rows = row_height;
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty.cols = col_width;
        self.pty.rows = row_height;
        if let Some(recorder) = self.recorder.get() {
            recorder.resize(col_width, row_height).await;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let inbound = match self.channel.take() {
            Some(c) if c.id() == channel => c,
            other => {
                self.channel = other;
                let _ = session.channel_failure(channel);
                return Ok(());
            }
        };
        let Some(identity) = self.identity.clone() else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let _ = session.channel_success(channel);
        self.shell_started = true;
        debug!(identity = %identity, peer = ?self.peer, stage = %SessionStage::AwaitHandshake, "shell requested");

        tokio::spawn(run_session(
            self.frontend.clone(),
            identity,
            self.peer,
            self.pty.clone(),
            inbound,
            session.handle(),
            self.recorder.clone(),
        ));
        Ok(())
    }
}

/// Drive one bastion session from identity to teardown.
async fn run_session(
    frontend: Arc<Frontend>,
    identity: String,
    peer: Option<SocketAddr>,
    pty: PtyRequest,
    channel: Channel<Msg>,
    handle: Handle,
    recorder_slot: Arc<OnceLock<Arc<SessionRecorder>>>,
) {
    let channel_id = channel.id();
    let mut inbound = channel.into_stream();
    let session_id = frontend.next_session_id();

    let exit_status = match frontend.pipeline().establish(&identity, pty.clone()).await {
        Err(e) => {
            let notice = format!("bastion: {e}\r\n");
            let _ = inbound.write_all(notice.as_bytes()).await;
            let _ = inbound.flush().await;
            1
        }
        Ok(established) => {
            let recorder = match frontend.recordings_dir() {
                Some(dir) => {
                    let meta = serde_json::json!({
                        "session_id": session_id,
                        "user": established.request.proxy_user,
                        "target": established.target,
                        "role": established.role,
                        "account": established.account,
                        "route": established.backend.route().to_string(),
                        "peer": peer.map(|p| p.to_string()),
                        "term": pty.term,
                        "cols": pty.cols,
                        "rows": pty.rows,
                    });
                    let recorder = Arc::new(SessionRecorder::start(dir, &session_id, meta).await);
                    debug!(session_id = %session_id, path = %recorder.path().display(), "recording session");
                    let _ = recorder_slot.set(recorder.clone());
                    Some(recorder)
                }
                None => None,
            };

            debug!(session_id = %session_id, stage = %SessionStage::BridgeChannels, "bridging");
            let summary = splice(inbound, established.backend, recorder.as_deref()).await;
            if let Some(recorder) = &recorder {
                recorder.finish().await;
            }
            info!(
                session_id = %session_id,
                user = %established.request.proxy_user,
                target = %established.target,
                ended_by = ?summary.ended_by,
                bytes_up = summary.bytes_up,
                bytes_down = summary.bytes_down,
                error = ?summary.error,
                stage = %SessionStage::Closed,
                "session closed"
            );
            0
        }
    };

    let _ = handle.exit_status_request(channel_id, exit_status).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
    // One session per connection: nothing is left to serve.
    let _ = handle
        .disconnect(
            Disconnect::ByApplication,
            "session ended".to_string(),
            String::new(),
        )
        .await;
}
