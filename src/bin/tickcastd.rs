//! tickcast daemon - interval broadcast scheduler and push server
//!
//! Serves the built-in `clock` and `sine` feeds to push clients over a
//! Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! tickcastd start --config ~/.config/tickcast/tickcastd.toml
//!
//! # Print the running daemon's status snapshot
//! tickcastd status
//!
//! # Validate a config file
//! tickcastd check-config --config ./tickcastd.toml
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tickcastd::config::DaemonConfig;
use tickcastd::feeds::builtin_sources;
use tickcastd::scheduler::Scheduler;
use tickcastd::server::{request_status, DaemonServer};

/// tickcast daemon - pushes feed updates to subscribed clients on a fixed interval
#[derive(Parser, Debug)]
#[command(name = "tickcastd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon in the foreground
    Start {
        /// Config file (defaults to ~/.config/tickcast/tickcastd.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Socket path, overriding the config file
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
    /// Print the running daemon's status snapshot as JSON
    Status {
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
    /// Load and validate a config file, then print the effective settings
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        config: None,
        socket: None,
    });

    match command {
        Command::Start { config, socket } => {
            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            run_daemon(config)
        }
        Command::Status { socket } => {
            let socket = match socket {
                Some(socket) => socket,
                None => DaemonConfig::load(None)?.socket_path,
            };
            print_status(&socket)
        }
        Command::CheckConfig { config } => {
            let loaded = DaemonConfig::load(config.as_deref())?;
            let rendered =
                toml::to_string_pretty(&loaded).context("Failed to render effective config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn print_status(socket: &Path) -> Result<()> {
    match request_status(socket).await {
        Ok(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Daemon is not reachable: {e}");
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tickcastd=info".parse()?)
                .add_directive("tickcast_core=info".parse()?)
                .add_directive("tickcast_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "tickcast daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone())?);
    for (feed, source) in builtin_sources(&config.feeds.sine) {
        scheduler.register_feed(feed, source);
    }
    let sweeper = scheduler.spawn_sweeper(cancel_token.clone());
    info!(
        pool_capacity = scheduler.timers().capacity(),
        sweeper = sweeper.is_some(),
        "Scheduler started"
    );

    let server = DaemonServer::new(&config, Arc::clone(&scheduler), cancel_token);

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    let reaped = scheduler.reap_all();
    info!(reaped, "tickcast daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
