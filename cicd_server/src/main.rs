//! Opsdeck CI/CD server.
//!
//! Runs the pipeline and freestyle engine behind its webhook/trigger HTTP
//! surface. Engine settings come from `CICD_*` environment variables.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use opsdeck_cicd::config::CicdConfig;
use opsdeck_cicd::orchestrator::Orchestrator;
use opsdeck_cicd::routes;

#[derive(Parser)]
#[command(name = "opsdeck-cicd", about = "Opsdeck CI/CD engine")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CICD_PORT", default_value = "9090")]
    port: u16,

    /// Root directory of the key-value store
    #[arg(long, env = "CICD_STORAGE_PATH", default_value = "./data/store")]
    storage_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    tracing::info!("Starting Opsdeck CI/CD engine...");

    let config = CicdConfig::from_env(&cli.storage_path);
    let engine = Arc::new(
        Orchestrator::init(config)
            .await
            .map_err(|e| anyhow::anyhow!("engine init: {e}"))?,
    );
    engine
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("engine start: {e}"))?;

    opsdeck_cicd::metrics::init_metrics();

    let app = routes::cicd_router(engine.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Opsdeck CI/CD listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping engine...");
    engine.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
