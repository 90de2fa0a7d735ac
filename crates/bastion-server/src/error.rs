//! Error type of the inbound SSH handler.

use bastion_core::BastionError;
use thiserror::Error;

/// russh requires handler errors to absorb its own error type.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bastion(#[from] BastionError),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Bastion(e) => e.kind(),
            SessionError::Ssh(_) => "ssh",
        }
    }
}
