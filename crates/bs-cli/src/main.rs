//! bsctl
//!
//! Operator client for the bootstrap agent.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bs_cli::client::{AgentClient, DEFAULT_AGENT_ADDRESS};
use bs_cli::commands;
use bs_cli::output::print_error;

/// Default plaintext bytes per chunk (the agent's default maximum)
const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024;

#[derive(Parser)]
#[command(name = "bsctl")]
#[command(author, version, about = "Bootstrap agent client")]
#[command(propagate_version = true)]
struct Cli {
    /// Agent address
    #[arg(short, long, global = true, env = "BS_AGENT_ADDRESS", default_value = DEFAULT_AGENT_ADDRESS)]
    agent: String,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt and upload a bundle
    Upload {
        /// Bundle to upload
        file: PathBuf,
        /// Plaintext bytes per chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
    },

    /// Request installation of packages
    Install {
        /// Packages as <id>@<version>
        #[arg(required = true)]
        packages: Vec<String>,
        /// Upload this bundle first, on the same connection
        #[arg(short, long)]
        bundle: Option<PathBuf>,
        /// Plaintext bytes per chunk when uploading
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// Follow progress until every item has finished
        #[arg(short, long)]
        wait: bool,
    },

    /// Pause or resume the installation queue
    Control {
        /// "stop" or "continue"
        action: String,
    },

    /// Show installation session status
    Status,

    /// Check that the agent is responding
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut client = match AgentClient::connect(&cli.agent).await {
        Ok(client) => client,
        Err(e) => {
            print_error(&format!("{:#}", e));
            return Err(e);
        }
    };

    match cli.command {
        Commands::Upload { file, chunk_size } => {
            commands::upload_command(&mut client, &file, chunk_size).await
        }
        Commands::Install {
            packages,
            bundle,
            chunk_size,
            wait,
        } => {
            commands::install_command(&mut client, bundle.as_deref(), chunk_size, &packages, wait)
                .await
        }
        Commands::Control { action } => commands::control_command(&mut client, &action).await,
        Commands::Status => commands::status_command(&mut client).await,
        Commands::Ping => commands::ping_command(&mut client).await,
    }
}
