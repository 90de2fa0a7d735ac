//! bastionctl: operator tool for the SSH bastion.
//!
//! Replays session recordings offline and talks to the bastion's admin API
//! for policy and agent inspection.

mod admin;
mod commands;

use admin::AdminClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// bastionctl: SSH bastion operator tool
#[derive(Parser)]
#[command(name = "bastionctl", version, about = "Operator tool for the SSH bastion")]
struct Cli {
    /// Bastion admin API base URL
    #[arg(
        long,
        global = true,
        env = "BASTION_ADMIN_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a session recording (session-<id>.jsonl)
    Playback {
        /// Recording file
        #[arg(long)]
        file: PathBuf,

        /// Replay speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },

    /// Inspect or reload the access policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// List registered agents
    Agents,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the user to role and targets mapping
    List {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Reload the policy from a file on the bastion host
    Reload {
        /// Path as seen by the bastion
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("bastionctl=debug,bastion_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("bastionctl=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Command::Playback { file, speed } => commands::playback::run(&file, speed).await,
        Command::Policy { action } => match AdminClient::new(&cli.server) {
            Ok(client) => match action {
                PolicyAction::List { json } => commands::policy::run_list(&client, json).await,
                PolicyAction::Reload { path } => commands::policy::run_reload(&client, &path).await,
            },
            Err(e) => Err(e),
        },
        Command::Agents => match AdminClient::new(&cli.server) {
            Ok(client) => commands::agents::run(&client).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        debug!(error = ?e, "command failed");
        eprintln!("bastionctl: {e:#}");
        std::process::exit(1);
    }
}
