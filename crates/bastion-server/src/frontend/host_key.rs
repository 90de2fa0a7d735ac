//! Inbound host identity.

use bastion_core::{BastionError, BastionResult};
use russh_keys::key::KeyPair;
use ssh_key::LineEnding;
use std::path::Path;

use crate::keyfile;

/// Load the host key at `path`, creating it on first run.
pub fn load_host_key(path: &Path) -> BastionResult<KeyPair> {
    let key = keyfile::load_or_generate(path, "bastion-host")?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| BastionError::Config(format!("host key encoding: {e}")))?;
    russh_keys::decode_secret_key(&pem, None)
        .map_err(|e| BastionError::Config(format!("host key {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_identity_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_ed25519");
        let first = load_host_key(&path).unwrap();
        let second = load_host_key(&path).unwrap();
        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint()
        );
    }
}
