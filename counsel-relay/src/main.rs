//! counsel-relay - streaming answer relay
//!
//! Bridges a remote AI streaming API to browsers over Server-Sent Events.
//!
//! Configuration priority: command line → environment → TOML file → defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use counsel_common::config::{ConfigOverrides, TomlConfig, ROOT_FOLDER_ENV, UPSTREAM_API_KEY_ENV};
use counsel_common::db::init_database;
use counsel_relay::upstream::HttpStreamClient;
use counsel_relay::{build_router, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for counsel-relay
#[derive(Parser, Debug)]
#[command(name = "counsel-relay")]
#[command(about = "Streaming answer relay (remote AI API to SSE)")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "COUNSEL_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(short, long, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    /// Explicit database file (overrides the root folder)
    #[arg(long, env = "COUNSEL_DATABASE")]
    database: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "COUNSEL_PORT")]
    port: Option<u16>,

    /// Base URL of the remote AI service
    #[arg(long, env = "COUNSEL_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Bearer key for the remote AI service
    #[arg(long, env = UPSTREAM_API_KEY_ENV, hide_env_values = true)]
    upstream_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_overrides(ConfigOverrides {
        root_folder: args.root_folder,
        database_path: args.database,
        port: args.port,
        upstream_base_url: args.upstream_url,
        upstream_api_key: args.upstream_api_key,
    });

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting counsel-relay v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    config.validate().context("Invalid configuration")?;

    let db_path = config.resolve_database_path();
    info!("Database path: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let client = HttpStreamClient::new(&config.upstream)
        .context("Failed to create upstream client")?;
    info!(
        upstream = %client.stream_url(),
        authenticated = config.upstream.api_key.is_some(),
        "Upstream stream endpoint configured"
    );
    info!(
        heartbeat_ms = config.relay.heartbeat_interval_ms,
        stream_timeout_secs = config.relay.stream_timeout_secs,
        channel_capacity = config.relay.channel_capacity,
        "Relay settings"
    );

    let shutdown = CancellationToken::new();
    let state = AppState::new(pool, Arc::new(client), config.relay.clone(), shutdown.clone());
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("counsel-relay listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let signal_token = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open relays write their shutdown frame and end their streams
            signal_token.cancel();
        })
        .await
    {
        error!("Server error: {}", e);
        return Err(e).context("Server error");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
