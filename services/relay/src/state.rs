//! Shared Application State
//!
//! Holds the loaded configuration and one pooled HTTP client for upstream calls.

use crate::config::Config;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Every upstream request made through `http` is bounded by the configured timeout.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }
}
