//! Parse `authorized_keys` files (OpenSSH format).
//!
//! The bastion uses the comment field to name the bastion user a key belongs
//! to, so a line like `ssh-ed25519 AAAA... alice` lets `alice+<host>` log in
//! with that key.

use crate::error::BastionResult;
use crate::identity;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;

/// A parsed authorized key entry.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// Key type (e.g., "ssh-ed25519").
    pub key_type: String,
    /// Base64-encoded key blob, as written in the file.
    pub key_data: String,
    /// Bastion user this key authenticates.
    pub user: String,
    /// SHA-256 fingerprint of the key blob (hex).
    pub fingerprint: String,
}

/// Parse an authorized_keys file, returning every well-formed entry.
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    content
        .lines()
        .filter_map(|line| parse_authorized_key_line(line.trim()))
        .collect()
}

fn is_key_type(field: &str) -> bool {
    field.starts_with("ssh-") || field.starts_with("ecdsa-") || field.starts_with("sk-")
}

fn parse_authorized_key_line(line: &str) -> Option<AuthorizedKey> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    // A leading options field (`no-pty`, `from="..."`) is skipped.
    let rest = if is_key_type(fields.first()?) {
        &fields[..]
    } else {
        &fields[1..]
    };
    if rest.len() < 2 || !is_key_type(rest[0]) {
        return None;
    }

    let key_type = rest[0].to_string();
    let key_data = rest[1].to_string();
    let raw = STANDARD.decode(&key_data).ok()?;
    let user = rest.get(2).map(|s| s.to_string()).unwrap_or_default();
    let fingerprint = identity::fingerprint(&raw);

    Some(AuthorizedKey {
        key_type,
        key_data,
        user,
        fingerprint,
    })
}

/// Load authorized keys from `path`. A missing file yields no keys.
pub fn load_authorized_keys(path: &Path) -> BastionResult<Vec<AuthorizedKey>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(parse_authorized_keys(&content))
}

/// The entry authorizing the key blob (base64, as presented by the client)
/// for `user`, if any.
pub fn find_authorized_key<'a>(
    user: &str,
    key_base64: &str,
    authorized: &'a [AuthorizedKey],
) -> Option<&'a AuthorizedKey> {
    authorized
        .iter()
        .find(|k| k.key_data == key_base64 && k.user == user)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Valid SSH ed25519 wire format: [4B len]["ssh-ed25519"][4B len][32B key]
    const TEST_KEY_B64: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";

    #[test]
    fn parse_simple_ed25519() {
        let line = format!("ssh-ed25519 {} alice", TEST_KEY_B64);
        let keys = parse_authorized_keys(&line);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_type, "ssh-ed25519");
        assert_eq!(keys[0].user, "alice");
        assert_eq!(keys[0].fingerprint.len(), 64);
    }

    #[test]
    fn skip_comments_and_empty() {
        let content = format!("# comment\n\nssh-ed25519 {} bob\n", TEST_KEY_B64);
        assert_eq!(parse_authorized_keys(&content).len(), 1);
    }

    #[test]
    fn options_prefix() {
        let line = format!("no-pty ssh-ed25519 {} carol", TEST_KEY_B64);
        let keys = parse_authorized_keys(&line);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_type, "ssh-ed25519");
        assert_eq!(keys[0].user, "carol");
    }

    #[test]
    fn skip_bad_base64() {
        assert!(parse_authorized_keys("ssh-ed25519 !!!notbase64 dave").is_empty());
    }

    #[test]
    fn authorization_binds_key_to_user() {
        let keys = parse_authorized_keys(&format!("ssh-ed25519 {} alice", TEST_KEY_B64));
        let found = find_authorized_key("alice", TEST_KEY_B64, &keys).unwrap();
        let blob = STANDARD.decode(TEST_KEY_B64).unwrap();
        assert_eq!(found.fingerprint, identity::fingerprint(&blob));
        assert!(find_authorized_key("mallory", TEST_KEY_B64, &keys).is_none());
        assert!(find_authorized_key("alice", "AAAAother", &keys).is_none());
    }

    #[test]
    fn missing_file_is_empty() {
        let keys = load_authorized_keys(Path::new("/nonexistent/authorized_keys")).unwrap();
        assert!(keys.is_empty());
    }
}
