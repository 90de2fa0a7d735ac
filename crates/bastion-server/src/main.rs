//! bastion-server: SSH bastion with ephemeral certificates and agent tunnels.
//!
//! Inbound clients log in as `user+target`. The bastion authorizes the pair
//! against its policy, has a CA sign a single-use key for the mapped backend
//! account and bridges the session to the target, directly or through an
//! agent connected over the tunnel endpoint.

mod backend;
mod ca;
mod config;
mod error;
mod frontend;
mod http;
mod keyfile;
mod policy;
mod server;
mod session;
mod tunnel;

use clap::Parser;
use config::{CaKind, CliOverrides, InboundAuthMode, ServerConfig};
use server::BastionServer;
use std::path::PathBuf;
use tracing::{error, info};

/// bastion-server: SSH bastion
#[derive(Parser, Debug)]
#[command(name = "bastion-server", version, about = "SSH bastion server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.bastion/config.toml")]
    config: String,

    /// Inbound SSH port
    #[arg(long)]
    ssh_port: Option<u16>,

    /// HTTP port (agent registration and admin API)
    #[arg(long)]
    http_port: Option<u16>,

    /// Policy file (JSON)
    #[arg(long)]
    policy: Option<String>,

    /// Host key file (created on first run)
    #[arg(long)]
    host_key: Option<String>,

    /// Directory for session recordings
    #[arg(long)]
    recordings_dir: Option<String>,

    /// Inbound client authentication (publickey or none)
    #[arg(long, value_parser = parse_inbound_auth)]
    inbound_auth: Option<InboundAuthMode>,

    /// Certificate authority (vault or local)
    #[arg(long, value_parser = parse_ca_kind)]
    ca: Option<CaKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_inbound_auth(s: &str) -> Result<InboundAuthMode, String> {
    match s {
        "publickey" => Ok(InboundAuthMode::Publickey),
        "none" => Ok(InboundAuthMode::None),
        other => Err(format!("unknown inbound auth '{other}' (publickey, none)")),
    }
}

fn parse_ca_kind(s: &str) -> Result<CaKind, String> {
    match s {
        "vault" => Ok(CaKind::Vault),
        "local" => Ok(CaKind::Local),
        other => Err(format!("unknown CA '{other}' (vault, local)")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bastion-server");

    let overrides = CliOverrides {
        ssh_port: cli.ssh_port,
        http_port: cli.http_port,
        policy: cli.policy,
        host_key: cli.host_key,
        recordings_dir: cli.recordings_dir,
        inbound_auth: cli.inbound_auth,
        ca_kind: cli.ca,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let bastion = match BastionServer::new(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = bastion.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("bastion-server stopped");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
