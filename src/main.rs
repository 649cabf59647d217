// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transfer relay server.
//!
//! Relays file-transfer payloads and chat between browsers that cannot
//! connect to each other directly:
//! - Two-party mode: one `sender` streams to one `receiver`
//! - Peer mode: every peer's frames fan out to all other peers
//!
//! # Usage
//!
//! ```bash
//! # Start the relay on the default port (8000)
//! transfer-relay
//!
//! # Custom port and config file
//! transfer-relay --port 9000 --config relay.json
//! ```
//!
//! Environment variables (`MAX_SESSIONS`, `SESSION_TIMEOUT`, ...) override
//! the config file; see `ServerConfig`.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use transfer_relay::server::{self, sweeper};
use transfer_relay::{AppState, ServerConfig};

/// Transfer Relay - WebSocket relay for browser-to-browser file transfer
#[derive(Parser, Debug)]
#[command(name = "transfer-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP/WebSocket port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Defaults, then config file, then environment, then CLI flags.
    let mut config = if let Some(path) = &args.config {
        info!("Loading config from {:?}", path);
        ServerConfig::from_file(path)?
    } else {
        ServerConfig::default()
    };
    config.apply_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_address = bind.parse()?;
    }
    config.validate()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       {} v{:<22} |",
        config.project_name,
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:     {:38} |", format!("{}:{}", config.bind_address, config.port));
    info!("|  Sessions: {:38} |", config.max_sessions);
    info!(
        "|  Timeout:  {:38} |",
        format!("{}s idle", config.session_timeout_secs)
    );
    info!(
        "|  Ping:     {:38} |",
        match config.ping_interval_secs {
            0 => "disabled".to_string(),
            secs => format!("{}s", secs),
        }
    );
    info!("+----------------------------------------------------+");

    let state = Arc::new(AppState::new(config));

    sweeper::spawn_sweeper(state.clone());
    sweeper::spawn_heartbeat(state.clone());

    // Handle shutdown signals
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        shutdown.notify_waiters();
    });

    server::run(state).await?;

    info!("Relay server stopped");
    Ok(())
}
