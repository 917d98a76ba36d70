//! mta-audit - Material transfer audit service
//!
//! HTTP trigger surface plus the periodic audit scheduler.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mta_audit::services::{AuditScheduler, HttpInferenceClient, InferenceClient};
use mta_audit::AppState;
use mta_common::config::TomlConfig;

#[derive(Parser, Debug)]
#[command(name = "mta-audit")]
#[command(about = "Material transfer compliance audit service")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "MTA_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long, env = "MTA_PORT")]
    port: Option<u16>,

    /// SQLite database path (overrides [database] path)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides [logging] level)
    #[arg(long, env = "MTA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Do not start the periodic scheduler
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = args.database {
        config.database.path = Some(path);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    mta_common::logging::init_tracing(&config.logging.level)?;

    info!("Starting mta-audit version {}", env!("CARGO_PKG_VERSION"));

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let db = mta_audit::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    let client = HttpInferenceClient::new(
        &config.inference,
        config.inference_api_key().map(str::to_string),
    )
    .context("Failed to create inference client")?;
    if !client.is_configured() {
        warn!("No inference API key configured; audit batches will fail until one is set");
    }
    if config.storage.signing_secret.is_none() {
        warn!("No storage signing secret configured; attachments will not be sent");
    }

    let runner = Arc::new(mta_audit::build_runner(db.clone(), &config, Arc::new(client)));
    let state = AppState::new(db, Arc::clone(&runner));

    let cancel = CancellationToken::new();
    let scheduler = if config.audit.scheduler_enabled && !args.no_scheduler {
        let scheduler = AuditScheduler::new(
            runner,
            Duration::from_secs(config.audit.schedule_interval_secs),
            Arc::clone(&state.last_error),
        );
        Some(scheduler.spawn(cancel.clone()))
    } else {
        info!("Periodic audit scheduler disabled");
        None
    };

    let app = mta_audit::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
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
