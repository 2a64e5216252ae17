//! Confluence buffer server daemon

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use confluence_core::bufferserver::ServerHandler;
use confluence_core::config::{
    DEFAULT_BACKLOG_WARNING_THRESHOLD, DEFAULT_MAX_BACKLOG, DEFAULT_PORT, DEFAULT_STALL_INTERVAL,
};
use confluence_core::protocol::DEFAULT_MAX_FRAME_LEN;
use confluence_core::transport::BufferServer;
use confluence_core::BrokerConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Confluence - buffer server for windowed stream processing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "CONFLUENCE_BIND", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Largest accepted frame body, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_bytes: usize,

    /// Outbound backlog per connection that triggers a slow-subscriber warning
    #[arg(long, default_value_t = DEFAULT_BACKLOG_WARNING_THRESHOLD)]
    backlog_warning: usize,

    /// Subscriber backlog at which the publisher feeding it stops being read
    #[arg(long, default_value_t = DEFAULT_MAX_BACKLOG)]
    max_backlog: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("confluence={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Confluence buffer server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = BrokerConfig {
        bind_address: args.bind,
        max_frame_len: args.max_frame_bytes,
        backlog_warning_threshold: args.backlog_warning,
        max_backlog: args.max_backlog,
        stall_interval: DEFAULT_STALL_INTERVAL,
    };
    let handler = Arc::new(ServerHandler::new(config));
    let server = BufferServer::bind(Arc::clone(&handler), args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    server_task.await.context("server task panicked")?;

    info!(
        publishers = handler.publisher_buffer_count(),
        groups = handler.group_count(),
        "Confluence buffer server stopped"
    );
    Ok(())
}
