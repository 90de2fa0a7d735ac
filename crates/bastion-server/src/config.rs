//! Server configuration: TOML file + CLI overrides.

use bastion_core::{BastionError, BastionResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub inbound: InboundSection,
    #[serde(default)]
    pub accounts: AccountsSection,
    #[serde(default)]
    pub ca: CaSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_host_key")]
    pub host_key: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_target_port")]
    pub default_target_port: u16,
    #[serde(default)]
    pub recordings_dir: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ssh_port: default_ssh_port(),
            http_port: default_http_port(),
            host_key: default_host_key(),
            dial_timeout_secs: default_dial_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            default_target_port: default_target_port(),
            recordings_dir: None,
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_policy_path")]
    pub path: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
        }
    }
}

/// How inbound SSH clients authenticate before RBAC runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundAuthMode {
    /// Accept any client; authorization relies only on the claimed username.
    None,
    /// Require a key listed in `authorized_keys` for the claimed bastion user.
    Publickey,
}

/// `[inbound]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSection {
    #[serde(default = "default_inbound_auth")]
    pub auth: InboundAuthMode,
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: String,
}

impl Default for InboundSection {
    fn default() -> Self {
        Self {
            auth: default_inbound_auth(),
            authorized_keys: default_authorized_keys(),
        }
    }
}

/// `[accounts]` section: resolved role to backend OS account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsSection {
    #[serde(default = "default_privileged_role")]
    pub privileged_role: String,
    #[serde(default = "default_privileged_account")]
    pub privileged_account: String,
    #[serde(default = "default_account")]
    pub default_account: String,
}

impl Default for AccountsSection {
    fn default() -> Self {
        Self {
            privileged_role: default_privileged_role(),
            privileged_account: default_privileged_account(),
            default_account: default_account(),
        }
    }
}

/// Which certificate authority signs ephemeral keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaKind {
    Vault,
    Local,
}

/// `[ca]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CaSection {
    #[serde(default = "default_ca_kind")]
    pub kind: CaKind,
    /// Vault address; falls back to `VAULT_ADDR`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    #[serde(default = "default_ca_timeout")]
    pub timeout_secs: u64,
    /// Local CA signing key (generated on first run).
    #[serde(default = "default_ca_key")]
    pub key: String,
    #[serde(default = "default_ca_ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub role_ttl: HashMap<String, u64>,
}

impl Default for CaSection {
    fn default() -> Self {
        Self {
            kind: default_ca_kind(),
            address: None,
            mount: default_vault_mount(),
            timeout_secs: default_ca_timeout(),
            key: default_ca_key(),
            ttl_secs: default_ca_ttl(),
            role_ttl: HashMap::new(),
        }
    }
}

/// `[tunnel]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// `[[routes]]` entry: targets matching `pattern` go through agent `agent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteEntry {
    pub pattern: String,
    pub agent: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_ssh_port() -> u16 {
    3023
}
fn default_http_port() -> u16 {
    8080
}
fn default_host_key() -> String {
    "~/.bastion/host_ed25519".to_string()
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_ack_timeout() -> u64 {
    5
}
fn default_target_port() -> u16 {
    22
}
fn default_policy_path() -> String {
    "policies.json".to_string()
}
fn default_inbound_auth() -> InboundAuthMode {
    InboundAuthMode::Publickey
}
fn default_authorized_keys() -> String {
    "~/.bastion/authorized_keys".to_string()
}
fn default_privileged_role() -> String {
    "admin-role".to_string()
}
fn default_privileged_account() -> String {
    "root".to_string()
}
fn default_account() -> String {
    "wazuhserver".to_string()
}
fn default_ca_kind() -> CaKind {
    CaKind::Vault
}
fn default_vault_mount() -> String {
    "ssh-client-signer".to_string()
}
fn default_ca_timeout() -> u64 {
    10
}
fn default_ca_key() -> String {
    "~/.bastion/ca_ed25519".to_string()
}
fn default_ca_ttl() -> u64 {
    900
}
fn default_channel_capacity() -> usize {
    100
}

/// Values the command line may override.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub ssh_port: Option<u16>,
    pub http_port: Option<u16>,
    pub policy: Option<String>,
    pub host_key: Option<String>,
    pub recordings_dir: Option<String>,
    pub inbound_auth: Option<InboundAuthMode>,
    pub ca_kind: Option<CaKind>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub ssh_port: u16,
    pub http_port: u16,
    pub host_key_path: PathBuf,
    pub policy_path: PathBuf,
    pub recordings_dir: Option<PathBuf>,
    pub dial_timeout: Duration,
    pub ack_timeout: Duration,
    pub default_target_port: u16,
    pub inbound_auth: InboundAuthMode,
    pub authorized_keys_path: PathBuf,
    pub accounts: AccountsSection,
    pub ca: CaSection,
    pub ca_key_path: PathBuf,
    pub channel_capacity: usize,
    pub routes: Vec<RouteEntry>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> BastionResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, cli)
    }

    pub fn parse_file(content: &str) -> BastionResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| BastionError::Config(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> BastionResult<Self> {
        if file.tunnel.channel_capacity == 0 {
            return Err(BastionError::Config(
                "tunnel.channel_capacity must be at least 1".into(),
            ));
        }

        let mut ca = file.ca;
        if let Some(kind) = cli.ca_kind {
            ca.kind = kind;
        }
        let ca_key_path = expand_tilde_str(&ca.key);

        let recordings_dir = cli
            .recordings_dir
            .or(file.server.recordings_dir)
            .map(|d| expand_tilde_str(&d));

        Ok(Self {
            bind: file.server.bind,
            ssh_port: cli.ssh_port.unwrap_or(file.server.ssh_port),
            http_port: cli.http_port.unwrap_or(file.server.http_port),
            host_key_path: expand_tilde_str(&cli.host_key.unwrap_or(file.server.host_key)),
            policy_path: expand_tilde_str(&cli.policy.unwrap_or(file.policy.path)),
            recordings_dir,
            dial_timeout: Duration::from_secs(file.server.dial_timeout_secs),
            ack_timeout: Duration::from_secs(file.server.ack_timeout_secs),
            default_target_port: file.server.default_target_port,
            inbound_auth: cli.inbound_auth.unwrap_or(file.inbound.auth),
            authorized_keys_path: expand_tilde_str(&file.inbound.authorized_keys),
            accounts: file.accounts,
            ca,
            ca_key_path,
            channel_capacity: file.tunnel.channel_capacity,
            routes: file.routes,
        })
    }

    /// TTL the local CA applies for `role`.
    pub fn role_ttl(&self, role: &str) -> Duration {
        Duration::from_secs(
            self.ca
                .role_ttl
                .get(role)
                .copied()
                .unwrap_or(self.ca.ttl_secs),
        )
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub(crate) fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
