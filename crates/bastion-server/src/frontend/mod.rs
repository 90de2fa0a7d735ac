//! Inbound SSH front-end.
//!
//! Clients connect with `ssh <user>+<target>@bastion`. Each connection gets a
//! [`SessionHandler`]; the interactive shell request hands the identity to
//! the [`SessionPipeline`] and splices the inbound channel to the backend.

mod handler;
mod host_key;

pub use handler::SessionHandler;
pub use host_key::load_host_key;

use bastion_core::identity::{short_fingerprint, PrincipalRequest};
use bastion_core::keys::{find_authorized_key, AuthorizedKey};
use russh::server::Config;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::session::SessionPipeline;

/// How inbound clients prove who they are.
#[derive(Debug, Clone)]
pub enum InboundAuth {
    /// Accept any client; authorization rests on the policy lookup alone.
    None,
    /// The presented key must be listed for the proxy user.
    Publickey(Arc<Vec<AuthorizedKey>>),
}

impl InboundAuth {
    pub fn methods(&self) -> MethodSet {
        match self {
            InboundAuth::None => MethodSet::NONE | MethodSet::PUBLICKEY,
            InboundAuth::Publickey(_) => MethodSet::PUBLICKEY,
        }
    }

    pub fn allows_none(&self) -> bool {
        matches!(self, InboundAuth::None)
    }

    /// Whether `key_base64` may log in as `identity`. The key is matched
    /// against the proxy user half of the identity.
    pub fn allows_key(&self, identity: &str, key_base64: &str) -> bool {
        match self {
            InboundAuth::None => true,
            InboundAuth::Publickey(keys) => match PrincipalRequest::parse(identity) {
                Ok(request) => match find_authorized_key(&request.proxy_user, key_base64, keys) {
                    Some(key) => {
                        debug!(
                            identity,
                            key_type = %key.key_type,
                            key = short_fingerprint(&key.fingerprint, 16),
                            "public key accepted"
                        );
                        true
                    }
                    None => false,
                },
                Err(e) => {
                    debug!(identity, error = %e, "identity unparsable at auth");
                    false
                }
            },
        }
    }
}

/// State shared by every inbound connection.
pub struct Frontend {
    pipeline: Arc<SessionPipeline>,
    auth: InboundAuth,
    recordings_dir: Option<PathBuf>,
    next_session: AtomicU64,
}

impl Frontend {
    pub fn new(
        pipeline: Arc<SessionPipeline>,
        auth: InboundAuth,
        recordings_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            auth,
            recordings_dir,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn pipeline(&self) -> &Arc<SessionPipeline> {
        &self.pipeline
    }

    pub fn auth(&self) -> &InboundAuth {
        &self.auth
    }

    pub fn recordings_dir(&self) -> Option<&PathBuf> {
        self.recordings_dir.as_ref()
    }

    /// Bastion session id, also used for the recording file name.
    pub fn next_session_id(&self) -> String {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", chrono::Utc::now().format("%Y%m%dT%H%M%S"))
    }

    pub fn handler(self: &Arc<Self>, peer: Option<SocketAddr>) -> SessionHandler {
        SessionHandler::new(self.clone(), peer)
    }

    /// russh server configuration for `host_key`.
    pub fn ssh_config(&self, host_key: KeyPair) -> Config {
        Config {
            keys: vec![host_key],
            methods: self.auth.methods(),
            auth_rejection_time: Duration::from_millis(500),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        }
    }
}
