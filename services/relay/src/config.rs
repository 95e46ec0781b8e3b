use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.0-flash-live-001";
pub const DEFAULT_ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 15;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// Upstream credentials are optional: a relay without them still starts and
/// answers the affected endpoints with an error.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_agent_id: Option<String>,
    pub google_api_key: Option<String>,
    pub live_model: String,
    pub elevenlabs_api_base: String,
    pub gemini_api_base: String,
    pub upstream_timeout: Duration,
    pub log_level: Level,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let mut bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        if let Some(port_str) = non_empty_var("PORT") {
            let port = port_str.parse::<u16>().map_err(|_| {
                ConfigError::InvalidValue(
                    "PORT".to_string(),
                    format!("'{}' is not a valid port", port_str),
                )
            })?;
            bind_address.set_port(port);
        }

        let elevenlabs_api_key = non_empty_var("ELEVENLABS_API_KEY");
        let elevenlabs_agent_id = non_empty_var("ELEVENLABS_AGENT_ID");
        let google_api_key = non_empty_var("GOOGLE_API_KEY").or_else(|| non_empty_var("GEMINI_API_KEY"));

        let live_model =
            non_empty_var("GEMINI_LIVE_MODEL").unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string());

        let elevenlabs_api_base = non_empty_var("ELEVENLABS_API_BASE")
            .unwrap_or_else(|| DEFAULT_ELEVENLABS_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let gemini_api_base = non_empty_var("GEMINI_API_BASE")
            .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let timeout_secs = match non_empty_var("UPSTREAM_TIMEOUT_SECS") {
            Some(value) => value.parse::<u64>().ok().filter(|secs| *secs > 0).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "UPSTREAM_TIMEOUT_SECS".to_string(),
                    format!("'{}' is not a positive number of seconds", value),
                )
            })?,
            None => DEFAULT_UPSTREAM_TIMEOUT_SECS,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            elevenlabs_api_key,
            elevenlabs_agent_id,
            google_api_key,
            live_model,
            elevenlabs_api_base,
            gemini_api_base,
            upstream_timeout: Duration::from_secs(timeout_secs),
            log_level,
        })
    }
}
