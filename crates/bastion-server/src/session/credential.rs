//! Single-use client keypairs.
//!
//! A fresh Ed25519 key is generated in memory for every bastion session,
//! certified by the CA and handed to the backend dialer. It is never written
//! to disk; the secret is zeroized when the last reference drops.

use bastion_core::{BastionError, BastionResult};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use russh_keys::key::KeyPair;
use ssh_key::public::{Ed25519PublicKey, KeyData};
use ssh_key::PublicKey;
use std::sync::Arc;

pub struct EphemeralKey {
    signing: SigningKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public half in OpenSSH format, as sent to the CA.
    pub fn public_openssh(&self, comment: &str) -> BastionResult<String> {
        let key_data = KeyData::Ed25519(Ed25519PublicKey(self.signing.verifying_key().to_bytes()));
        PublicKey::new(key_data, comment)
            .to_openssh()
            .map_err(|e| BastionError::Certificate(format!("encoding ephemeral key: {e}")))
    }

    /// Consume into the keypair the SSH client authenticates with.
    pub fn into_keypair(self) -> Arc<KeyPair> {
        Arc::new(KeyPair::Ed25519(self.signing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique() {
        let a = EphemeralKey::generate().public_openssh("x").unwrap();
        let b = EphemeralKey::generate().public_openssh("x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn public_key_is_openssh_ed25519() {
        let text = EphemeralKey::generate().public_openssh("alice@bastion").unwrap();
        assert!(text.starts_with("ssh-ed25519 "));
        assert!(text.ends_with(" alice@bastion"));
        let parsed = PublicKey::from_openssh(&text).unwrap();
        assert_eq!(parsed.algorithm(), ssh_key::Algorithm::Ed25519);
    }
}
