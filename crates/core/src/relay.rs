//! Client for the relay service that holds upstream credentials.

use crate::error::ConnectionError;
use reqwest::header::CONTENT_TYPE;
use std::{future::Future, time::Duration};
use tracing::{debug, instrument};

pub const DEFAULT_RELAY_URL: &str = "http://localhost:3001";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    agent_id: Option<String>,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            agent_id: None,
            timeout,
        }
    }

    /// Agent to request a signed URL for; the relay's default is used when unset.
    pub fn with_agent_id(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Bounds an operation by the configured timeout.
    pub async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T, ConnectionError>
    where
        F: Future<Output = Result<T, ConnectionError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ConnectionError::Timeout(self.timeout, what))?
    }

    /// The relay's text-streaming socket, with the scheme switched to ws/wss.
    pub fn chat_socket_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ws/chat")
    }

    /// Fetches a short-lived WebSocket URL for the managed speech agent.
    #[instrument(skip(self), fields(relay = %self.base_url))]
    pub async fn signed_url(&self) -> Result<String, ConnectionError> {
        self.bounded("fetching signed url", async {
            let mut request = self.http.get(format!("{}/elevenlabs/signed-url", self.base_url));
            if let Some(agent_id) = &self.agent_id {
                request = request.query(&[("agent_id", agent_id)]);
            }
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(relay_status(status.as_u16(), response.text().await?));
            }
            let body: serde_json::Value = response.json().await?;
            let url = extract_signed_url(&body).ok_or(ConnectionError::MissingUrl)?;
            debug!("Received signed url");
            Ok(url)
        })
        .await
    }

    /// Sends an SDP offer through the relay and returns the answer SDP.
    #[instrument(skip(self, offer_sdp), fields(relay = %self.base_url))]
    pub async fn exchange_sdp(&self, model: &str, offer_sdp: &str) -> Result<String, ConnectionError> {
        self.bounded("exchanging session description", async {
            let response = self
                .http
                .post(format!("{}/gemini/connect", self.base_url))
                .query(&[("model", model)])
                .header(CONTENT_TYPE, "application/sdp")
                .body(offer_sdp.to_string())
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(relay_status(status.as_u16(), body));
            }
            Ok(body)
        })
        .await
    }

    /// Whether the relay answers `/health` with `{"ok": true}`.
    pub async fn health(&self) -> Result<bool, ConnectionError> {
        self.bounded("checking relay health", async {
            let response = self
                .http
                .get(format!("{}/health", self.base_url))
                .send()
                .await?;
            let body: serde_json::Value = response.json().await?;
            Ok(body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .await
    }
}

/// Picks the first non-empty of `signed_url`, `url`, `ws_url`.
fn extract_signed_url(body: &serde_json::Value) -> Option<String> {
    ["signed_url", "url", "ws_url"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .find(|url| !url.is_empty())
        .map(str::to_owned)
}

fn relay_status(status: u16, body: String) -> ConnectionError {
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or(body);
    ConnectionError::RelayStatus { status, message }
}
