//! Certificate authority clients.
//!
//! The bastion never holds a long-lived credential for the targets. For every
//! session it generates a fresh keypair and asks a CA to sign the public half
//! as an OpenSSH user certificate for the mapped backend account.

mod local;
mod vault;

pub use local::LocalCa;
pub use vault::VaultCa;

use async_trait::async_trait;
use bastion_core::{BastionError, BastionResult};
use ssh_key::Certificate;
use std::sync::Arc;

use crate::config::{CaKind, ServerConfig};

/// What to sign.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Public key in OpenSSH format (`ssh-ed25519 AAAA... comment`).
    pub public_key: String,
    /// Role resolved by the policy store; selects the CA-side role config.
    pub role: String,
    /// Backend account the certificate is valid for.
    pub principal: String,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Sign `request.public_key`. Any rejection is a
    /// [`BastionError::Certificate`].
    async fn sign(&self, request: &SignRequest) -> BastionResult<Certificate>;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Startup check that the CA is usable.
    async fn ready(&self) -> BastionResult<()> {
        Ok(())
    }
}

/// Build the CA selected by `config.ca.kind`.
pub fn from_config(config: &ServerConfig) -> BastionResult<Arc<dyn CertificateAuthority>> {
    match config.ca.kind {
        CaKind::Vault => {
            let address = config
                .ca
                .address
                .clone()
                .or_else(|| std::env::var("VAULT_ADDR").ok())
                .ok_or_else(|| {
                    BastionError::Config("vault CA needs ca.address or VAULT_ADDR".into())
                })?;
            let token = std::env::var("VAULT_TOKEN")
                .map_err(|_| BastionError::Config("vault CA needs VAULT_TOKEN".into()))?;
            let ca = VaultCa::new(
                &address,
                &config.ca.mount,
                &token,
                std::time::Duration::from_secs(config.ca.timeout_secs),
            )?;
            Ok(Arc::new(ca))
        }
        CaKind::Local => {
            let ca = LocalCa::load_or_generate(&config.ca_key_path, config)?;
            Ok(Arc::new(ca))
        }
    }
}

/// Parse the `signed_key` text a CA returns.
pub(crate) fn parse_certificate(text: &str) -> BastionResult<Certificate> {
    Certificate::from_openssh(text.trim())
        .map_err(|e| BastionError::Certificate(format!("CA returned an unparsable certificate: {e}")))
}
