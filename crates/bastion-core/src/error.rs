use thiserror::Error;

/// Errors produced by the bastion protocol and session layers.
///
/// The first five variants are the session-terminal taxonomy: any of them
/// ends the owning bastion session, is logged with its [`kind`](Self::kind)
/// tag and is never retried.
#[derive(Debug, Error)]
pub enum BastionError {
    /// Malformed identity string or malformed control frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The policy store denied `user` access to `target`.
    #[error("access denied: user '{user}' may not reach '{target}'")]
    Authorization { user: String, target: String },

    /// The certificate authority rejected the signing request.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Target unreachable, credential rejected, or terminal negotiation failed.
    #[error("backend dial failed: {0}")]
    BackendDial(String),

    /// Agent not registered, forward rejected, or send on a closed session.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("policy source unreadable: {0}")]
    PolicyIo(String),

    #[error("policy source malformed: {0}")]
    PolicyParse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BastionError {
    /// Short tag used as the `kind` field in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BastionError::Protocol(_) => "protocol",
            BastionError::Authorization { .. } => "authorization",
            BastionError::Certificate(_) => "certificate",
            BastionError::BackendDial(_) => "backend_dial",
            BastionError::Tunnel(_) => "tunnel",
            BastionError::PolicyIo(_) | BastionError::PolicyParse(_) => "policy",
            BastionError::Config(_) => "config",
            BastionError::Transport(_) => "transport",
            BastionError::Timeout(_) => "timeout",
            BastionError::Io(_) => "io",
            BastionError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for BastionError {
    fn from(e: serde_json::Error) -> Self {
        BastionError::Protocol(e.to_string())
    }
}

pub type BastionResult<T> = Result<T, BastionError>;
