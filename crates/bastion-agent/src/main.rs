//! bastion-agent: exposes a private network to the bastion.
//!
//! Keeps one outbound WebSocket open to the bastion's registration endpoint
//! and dials local targets on its behalf. Reconnects with exponential
//! backoff; sessions do not survive a reconnect.

mod backoff;
mod transport;
mod tunnel;

use backoff::Backoff;
use bastion_core::TargetPattern;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tunnel::AgentOptions;

/// bastion-agent: tunnel agent for the SSH bastion
#[derive(Parser, Debug)]
#[command(name = "bastion-agent", version, about = "Tunnel agent for the SSH bastion")]
struct Cli {
    /// Bastion registration endpoint (e.g. ws://bastion:8080/ws)
    #[arg(long, env = "BASTION_URL")]
    bastion_url: String,

    /// Id to register under; the bastion routes targets to it by this id
    #[arg(long, env = "AGENT_ID")]
    agent_id: String,

    /// Allowed target pattern (exact, `*`, or `prefix*`); repeatable
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Local dial timeout in seconds
    #[arg(long, default_value_t = 5)]
    dial_timeout: u64,

    /// First reconnect delay in seconds
    #[arg(long, default_value_t = 1)]
    backoff_initial: u64,

    /// Reconnect delay ceiling in seconds
    #[arg(long, default_value_t = 60)]
    backoff_max: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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

    let url = match transport::registration_url(&cli.bastion_url, &cli.agent_id) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let options = Arc::new(AgentOptions {
        allow: cli.allow.iter().map(|p| TargetPattern::parse(p)).collect(),
        dial_timeout: Duration::from_secs(cli.dial_timeout),
        ..Default::default()
    });
    if options.allow.is_empty() {
        warn!("no --allow patterns given, every target the bastion asks for will be dialed");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %cli.agent_id,
        "starting bastion-agent"
    );

    tokio::select! {
        _ = run(url, options, Backoff::new(
            Duration::from_secs(cli.backoff_initial),
            Duration::from_secs(cli.backoff_max),
        )) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    info!("bastion-agent stopped");
}

async fn run(url: String, options: Arc<AgentOptions>, mut backoff: Backoff) {
    loop {
        match transport::connect(&url).await {
            Ok((sink, stream)) => {
                backoff.reset();
                match tunnel::serve(sink, stream, options.clone()).await {
                    Ok(()) => info!("bastion closed the tunnel"),
                    Err(e) => warn!(kind = e.kind(), error = %e, "tunnel failed"),
                }
            }
            Err(e) => warn!(error = %e, "cannot reach bastion"),
        }
        let delay = backoff.next_delay();
        info!(delay_secs = delay.as_secs(), "reconnecting");
        tokio::time::sleep(delay).await;
    }
}
