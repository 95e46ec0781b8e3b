//! Main Entrypoint for the Parley Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging and the shared upstream HTTP client.
//! 3. Constructing the Axum router.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use parley_relay::{config::Config, router::create_router, state::AppState};
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.as_str().to_lowercase()))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    if config.elevenlabs_api_key.is_none() {
        warn!("ELEVENLABS_API_KEY is not set; /elevenlabs/signed-url will reject requests.");
    }
    if config.google_api_key.is_none() {
        warn!("GOOGLE_API_KEY (or GEMINI_API_KEY) is not set; /gemini/connect will reject requests.");
    }

    let bind_address = config.bind_address;
    let live_model = config.live_model.clone();
    let app_state = Arc::new(AppState::new(config).context("Failed to build upstream client")?);

    // --- 3. Create Router ---
    let app = create_router(app_state);

    // --- 4. Start Server ---
    info!(
        live_model = %live_model,
        bind_address = %bind_address,
        "Relay configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
