//! Huddle Server - Main Entry Point

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use huddle_server::{api, config, voice};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Huddle Server"
    );

    // Initialize media engine for the SFU
    let engine = Arc::new(
        voice::WebRtcMediaEngine::from_config(&config)
            .context("Failed to initialize media engine")?,
    );

    // Build application state
    let state = api::AppState::new(config.clone(), engine);

    // Build router
    let app = api::create_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    state.shutdown().await;
    info!("Server shutdown complete");

    Ok(())
}
