//! Wires the bastion together and runs its two listeners.
//!
//! The SSH listener hands every accepted connection to its own russh session
//! task. The HTTP listener serves agent registration and the admin API. The
//! policy store and agent registry are the only state shared between them.

use bastion_core::keys::load_authorized_keys;
use bastion_core::{BastionError, BastionResult};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::backend::{RouteTable, SshDialer};
use crate::ca;
use crate::config::{InboundAuthMode, ServerConfig};
use crate::frontend::{load_host_key, Frontend, InboundAuth};
use crate::http::{self, AppState};
use crate::policy::PolicyStore;
use crate::session::{AccountMap, SessionPipeline};
use crate::tunnel::{AgentRegistry, TunnelOptions};

pub struct BastionServer {
    config: ServerConfig,
    policy: Arc<PolicyStore>,
    registry: Arc<AgentRegistry>,
    frontend: Arc<Frontend>,
    ssh_config: Arc<russh::server::Config>,
}

impl BastionServer {
    /// Load the policy, host key and CA, and build the session pipeline.
    pub async fn new(config: ServerConfig) -> BastionResult<Self> {
        let policy = Arc::new(PolicyStore::load(&config.policy_path)?);
        info!(path = %config.policy_path.display(), users = policy.len(), "policy loaded");
        if policy.is_empty() {
            warn!("policy is empty: every session will be denied");
        }

        let registry = Arc::new(AgentRegistry::new(TunnelOptions {
            channel_capacity: config.channel_capacity,
            ack_timeout: config.ack_timeout,
        }));

        let authority = ca::from_config(&config)?;
        authority.ready().await?;
        info!(ca = authority.name(), "certificate authority ready");

        let routes = RouteTable::new(&config.routes, registry.clone());
        let dialer = Arc::new(SshDialer::new(routes, config.dial_timeout));
        let pipeline = Arc::new(SessionPipeline::new(
            policy.clone(),
            authority,
            dialer,
            AccountMap::from(&config.accounts),
            config.default_target_port,
            Duration::from_secs(config.ca.timeout_secs),
        ));

        let auth = match config.inbound_auth {
            InboundAuthMode::None => {
                warn!("inbound auth is 'none': any client may claim any identity, access rests on the policy alone");
                InboundAuth::None
            }
            InboundAuthMode::Publickey => {
                let keys = load_authorized_keys(&config.authorized_keys_path)?;
                if keys.is_empty() {
                    warn!(
                        path = %config.authorized_keys_path.display(),
                        "no authorized keys loaded, every inbound login will be refused"
                    );
                } else {
                    info!(count = keys.len(), "loaded authorized keys");
                }
                InboundAuth::Publickey(Arc::new(keys))
            }
        };

        if let Some(dir) = &config.recordings_dir {
            info!(path = %dir.display(), "session recording enabled");
        }

        let host_key = load_host_key(&config.host_key_path)?;
        let frontend = Arc::new(Frontend::new(pipeline, auth, config.recordings_dir.clone()));
        let ssh_config = Arc::new(frontend.ssh_config(host_key));

        Ok(Self {
            config,
            policy,
            registry,
            frontend,
            ssh_config,
        })
    }

    /// Serve until either listener fails.
    pub async fn run(self) -> BastionResult<()> {
        let bind = self.config.bind.as_str();
        let ssh_listener = TcpListener::bind((bind, self.config.ssh_port))
            .await
            .map_err(|e| BastionError::Transport(format!("ssh bind failed: {e}")))?;
        let http_listener = TcpListener::bind((bind, self.config.http_port))
            .await
            .map_err(|e| BastionError::Transport(format!("http bind failed: {e}")))?;
        info!(bind, ssh_port = self.config.ssh_port, http_port = self.config.http_port, "listening");

        let app = http::router(AppState {
            policy: self.policy.clone(),
            registry: self.registry.clone(),
        });

        tokio::select! {
            result = serve_ssh(ssh_listener, self.frontend.clone(), self.ssh_config.clone()) => result,
            result = axum::serve(http_listener, app).into_future() => {
                result.map_err(|e| BastionError::Transport(format!("http server failed: {e}")))
            }
        }
    }
}

async fn serve_ssh(
    listener: TcpListener,
    frontend: Arc<Frontend>,
    config: Arc<russh::server::Config>,
) -> BastionResult<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "ssh accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let handler = frontend.handler(Some(peer));
        let config = config.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "inbound connection");
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(peer = %peer, kind = e.kind(), error = %e, "inbound connection ended");
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "ssh handshake failed"),
            }
        });
    }
}
