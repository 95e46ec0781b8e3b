//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the relay, including the
//! WebSocket endpoint and the CORS policy.

use crate::{handlers, state::AppState, ws::chat_handler};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Largest SDP offer accepted by `/gemini/connect`.
pub const MAX_SDP_BYTES: usize = 2 * 1024 * 1024;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/elevenlabs/signed-url", get(handlers::signed_url))
        .route(
            "/gemini/connect",
            post(handlers::gemini_connect).layer(DefaultBodyLimit::max(MAX_SDP_BYTES)),
        )
        .route("/ws/chat", get(chat_handler))
        .with_state(app_state)
        .layer(cors)
}
