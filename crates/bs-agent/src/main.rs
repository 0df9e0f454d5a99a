//! Bootstrap Agent Daemon
//!
//! Accepts a trusted client, receives an encrypted bundle and runs the
//! installers it contains.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bs_agent::reaper::run_upload_reaper;
use bs_agent::server::AgentServer;
use bs_agent::AgentState;
use bs_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "bs-agent")]
#[command(about = "Bootstrap agent daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Working directory for uploads (overrides config)
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write a configuration file with the defaults and exit
    #[arg(long)]
    init_config: bool,

    /// Overwrite an existing file with --init-config
    #[arg(long, requires = "init_config")]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.init_config {
        return init_config(&args);
    }

    tracing::info!("Bootstrap agent starting...");

    // Load configuration
    let mut config: AgentConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                AgentConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            AgentConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    config.validate().context("Invalid configuration")?;

    match config.install.resolve_platform() {
        Ok(platform) => tracing::info!("Installer platform: {}", platform),
        Err(e) => tracing::warn!("{}; installs will fail on this host", e),
    }

    let bind_addr = config.bind_address.clone();
    let state = Arc::new(AgentState::new(config));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let reaper = tokio::spawn(run_upload_reaper(Arc::clone(&state), cancel.clone()));

    let server = AgentServer::new(bind_addr, Arc::clone(&state)).with_shutdown_token(cancel.clone());
    server.run().await?;

    if let Err(e) = reaper.await {
        tracing::warn!("Upload reaper ended abnormally: {}", e);
    }
    state.installer.tasks().shutdown().await;

    tracing::info!("Agent shutdown complete");
    Ok(())
}

/// Write the default configuration, with any CLI overrides applied
fn init_config(args: &Args) -> Result<()> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    if path.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists: {:?} (use --force to overwrite)",
            path
        );
    }

    let mut defaults = AgentConfig::default();
    if let Some(bind) = &args.bind {
        defaults.bind_address = bind.clone();
    }
    if let Some(work_dir) = &args.work_dir {
        defaults.work_dir = work_dir.clone();
    }
    defaults.validate().context("Invalid configuration")?;

    config::save_config(&path, &defaults)
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    tracing::info!("Created configuration file {:?}", path);
    Ok(())
}
