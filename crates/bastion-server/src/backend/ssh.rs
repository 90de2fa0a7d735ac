//! SSH client leg using the ephemeral certificate.

use async_trait::async_trait;
use bastion_core::{BastionError, BastionResult};
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{BackendDialer, BackendIo, BackendStream, DialRequest, Route, RouteTable};

/// Host keys of targets are not pinned; the certificate binds the client
/// side only. The key fingerprint is logged for audit.
struct TargetHandler {
    target: String,
}

#[async_trait]
impl client::Handler for TargetHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            target = %self.target,
            host_key = %server_public_key.fingerprint(),
            "target host key"
        );
        Ok(true)
    }
}

pub struct SshDialer {
    routes: RouteTable,
    dial_timeout: Duration,
    config: Arc<client::Config>,
}

impl SshDialer {
    pub fn new(routes: RouteTable, dial_timeout: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            routes,
            dial_timeout,
            config: Arc::new(config),
        }
    }

    async fn open_transport(&self, route: &Route, target: &str) -> BastionResult<Box<dyn BackendIo>> {
        match route {
            Route::Direct => {
                let tcp = TcpStream::connect(target)
                    .await
                    .map_err(|e| BastionError::BackendDial(format!("connect {target}: {e}")))?;
                let _ = tcp.set_nodelay(true);
                Ok(Box::new(tcp))
            }
            Route::Agent(agent_id) => {
                let conn = self.routes.registry().get(agent_id).await.ok_or_else(|| {
                    BastionError::Tunnel(format!("agent '{agent_id}' is not registered"))
                })?;
                let stream = conn.open_stream(target).await?;
                debug!(
                    agent_id = stream.agent_id(),
                    session_id = stream.session_id(),
                    target = %target,
                    "tunnel session open"
                );
                Ok(Box::new(stream))
            }
        }
    }

    async fn establish(&self, request: DialRequest) -> BastionResult<BackendStream> {
        let route = self.routes.resolve(&request.target).await?;
        let transport = self.open_transport(&route, &request.target).await?;

        let handler = TargetHandler {
            target: request.target.clone(),
        };
        let dial_err =
            |stage: &str, e: russh::Error| BastionError::BackendDial(format!("{stage}: {e}"));

        let mut handle: Handle<TargetHandler> =
            client::connect_stream(self.config.clone(), transport, handler)
                .await
                .map_err(|e| dial_err("ssh handshake", e))?;

        let accepted = handle
            .authenticate_openssh_cert(&request.account, request.key.clone(), request.certificate)
            .await
            .map_err(|e| dial_err("authentication", e))?;
        if !accepted {
            return Err(BastionError::BackendDial(format!(
                "{} rejected certificate for account '{}'",
                request.target, request.account
            )));
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| dial_err("open session channel", e))?;
        channel
            .request_pty(
                true,
                &request.pty.term,
                request.pty.cols,
                request.pty.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| dial_err("pty request", e))?;
        expect_success(&mut channel, "pty request").await?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| dial_err("shell request", e))?;
        expect_success(&mut channel, "shell request").await?;

        info!(target = %request.target, account = %request.account, route = %route, "backend shell ready");
        Ok(BackendStream::new(channel.into_stream(), route).with_keepalive(handle))
    }
}

/// Wait for the reply to a `want_reply` request.
async fn expect_success(
    channel: &mut russh::Channel<client::Msg>,
    what: &str,
) -> BastionResult<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(BastionError::BackendDial(format!("{what} refused by target")))
            }
            Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) | None => {
                return Err(BastionError::BackendDial(format!(
                    "channel closed during {what}"
                )))
            }
            Some(_) => continue,
        }
    }
}

#[async_trait]
impl BackendDialer for SshDialer {
    async fn dial(&self, request: DialRequest) -> BastionResult<BackendStream> {
        let target = request.target.clone();
        debug!(target = %target, account = %request.account, "dialing backend");
        match tokio::time::timeout(self.dial_timeout, self.establish(request)).await {
            Ok(result) => result,
            Err(_) => Err(BastionError::BackendDial(format!(
                "{target}: timed out after {:?}",
                self.dial_timeout
            ))),
        }
    }
}
