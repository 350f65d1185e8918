//! Gangway daemon
//!
//! Local-socket gateway exposing host capabilities to browser clients.
//!
//! # Usage
//!
//! ```bash
//! # File manager only, restricted to one subtree
//! gangway --enable-file-manager --allowed-path /srv/data
//!
//! # Everything, with a config file as the baseline
//! gangway --config /etc/gangway.toml --enable-terminal --enable-notification
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gangway_core::GatewayConfig;
use gangway_daemon::server;
use gangway_daemon::Gateway;

#[derive(Parser, Debug)]
#[command(name = "gangway")]
#[command(about = "Local-socket gateway for file, terminal, and notification sessions")]
#[command(version)]
struct Args {
    /// Unix socket to listen on
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the file-manager endpoint
    #[arg(long)]
    enable_file_manager: bool,

    /// Serve the terminal endpoint
    #[arg(long)]
    enable_terminal: bool,

    /// Serve the notification endpoint
    #[arg(long)]
    enable_notification: bool,

    /// Filesystem root the file manager may reach (repeatable)
    #[arg(long = "allowed-path")]
    allowed_paths: Vec<PathBuf>,

    /// Filesystem root the file manager must never reach (repeatable)
    #[arg(long = "denied-path")]
    denied_paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log level {:?}", args.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // The config file is the baseline; flags only ever add to it.
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load_from(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(socket) = args.unix_socket {
        config.socket_path = socket;
    }
    config.enable_file_manager |= args.enable_file_manager;
    config.enable_terminal |= args.enable_terminal;
    config.enable_notification |= args.enable_notification;
    config.allowed_paths.extend(args.allowed_paths);
    config.denied_paths.extend(args.denied_paths);
    config.validate()?;

    let listener = server::bind_socket(&config.socket_path)
        .with_context(|| format!("failed to bind {:?}", config.socket_path))?;
    let socket_path = config.socket_path.clone();

    info!("starting gangway gateway");
    let gateway = Arc::new(Gateway::new(config));
    let shutdown = gateway.shutdown_token();
    let serving = tokio::spawn(gateway.serve(listener));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("termination requested, shutting down"),
    }
    shutdown.cancel();

    serving.await??;
    let _ = std::fs::remove_file(&socket_path);
    info!("gateway stopped");
    Ok(())
}
