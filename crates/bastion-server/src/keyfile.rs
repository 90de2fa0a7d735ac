//! Persistent Ed25519 key files (OpenSSH private key format).
//!
//! Used for the inbound host key and the local CA key. Files are written
//! with 0600 permissions; a missing parent directory is created with 0700.

use bastion_core::{BastionError, BastionResult};
use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::fs;
use std::path::Path;
use tracing::info;

/// Load the key at `path`, generating and persisting a new one if absent.
pub fn load_or_generate(path: &Path, comment: &str) -> BastionResult<PrivateKey> {
    if path.exists() {
        return load(path);
    }
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| BastionError::Other(format!("key generation failed: {e}")))?;
    key.set_comment(comment);
    save(path, &key)?;
    info!(
        path = %path.display(),
        fingerprint = %key.public_key().fingerprint(Default::default()),
        "generated new key"
    );
    Ok(key)
}

pub fn load(path: &Path) -> BastionResult<PrivateKey> {
    let pem = fs::read_to_string(path)?;
    PrivateKey::from_openssh(&pem)
        .map_err(|e| BastionError::Config(format!("invalid key file {}: {e}", path.display())))
}

fn save(path: &Path, key: &PrivateKey) -> BastionResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| BastionError::Other(format!("key encoding failed: {e}")))?;
    fs::write(path, pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
