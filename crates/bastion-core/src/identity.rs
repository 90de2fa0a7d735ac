//! Identity strings presented by inbound clients.
//!
//! The SSH username is overloaded to carry both the bastion user and the
//! target host: `ssh alice+10.0.0.5@bastion`.

use crate::error::{BastionError, BastionResult};
use sha2::{Digest, Sha256};
use std::fmt;

/// Separator between the proxy user and the target host.
pub const PRINCIPAL_DELIMITER: char = '+';

/// A parsed `proxyUser+targetHost` identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalRequest {
    /// Bastion user looked up in the policy store.
    pub proxy_user: String,
    /// Requested target, with or without a port.
    pub target_host: String,
}

impl PrincipalRequest {
    /// Parse an identity string. Exactly two non-empty parts are required.
    pub fn parse(identity: &str) -> BastionResult<Self> {
        let parts: Vec<&str> = identity.split(PRINCIPAL_DELIMITER).collect();
        if parts.len() != 2 {
            return Err(BastionError::Protocol(format!(
                "identity '{identity}' must have the form user{PRINCIPAL_DELIMITER}host ({} parts found)",
                parts.len()
            )));
        }
        let (user, host) = (parts[0], parts[1]);
        if user.is_empty() || host.is_empty() {
            return Err(BastionError::Protocol(format!(
                "identity '{identity}' has an empty user or host"
            )));
        }
        Ok(Self {
            proxy_user: user.to_string(),
            target_host: host.to_string(),
        })
    }
}

impl fmt::Display for PrincipalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.proxy_user, PRINCIPAL_DELIMITER, self.target_host)
    }
}

/// Whether `target` already names a port.
///
/// Bracketed IPv6 literals (`[::1]:22`) carry a port only after the bracket;
/// a bare IPv6 literal never does.
pub fn has_port(target: &str) -> bool {
    if let Some(rest) = target.strip_prefix('[') {
        return rest
            .split_once(']')
            .map(|(_, tail)| tail.starts_with(':'))
            .unwrap_or(false);
    }
    match target.matches(':').count() {
        1 => target
            .rsplit_once(':')
            .map(|(_, port)| port.parse::<u16>().is_ok())
            .unwrap_or(false),
        _ => false,
    }
}

/// Append `default_port` to `target` unless it already names one.
pub fn target_with_port(target: &str, default_port: u16) -> String {
    if has_port(target) {
        target.to_string()
    } else if target.contains(':') && !target.starts_with('[') {
        format!("[{target}]:{default_port}")
    } else {
        format!("{target}:{default_port}")
    }
}

/// Strip the port from a `host:port` target, if present.
pub fn host_part(target: &str) -> &str {
    if !has_port(target) {
        return target;
    }
    match target.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => target,
    }
}

/// Hex-encoded SHA-256 of a public key blob, used in log lines.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// First `len` characters of a fingerprint.
pub fn short_fingerprint(fp: &str, len: usize) -> &str {
    &fp[..len.min(fp.len())]
}
