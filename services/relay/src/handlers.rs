//! Axum Handlers for the REST API
//!
//! Credentials never leave this module: clients get a short-lived signed URL
//! or an SDP answer, never an API key.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::state::AppState;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

pub enum ApiError {
    BadRequest(String),
    /// The relay itself is not configured for the request.
    Misconfigured(String),
    /// An upstream call failed; the client sees `message`, the log gets `source`.
    Upstream {
        message: &'static str,
        source: anyhow::Error,
    },
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Misconfigured(message) => {
                error!("Relay misconfigured: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ApiError::Upstream { message, source } => {
                error!(error = ?source, "{}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize, Debug, Default)]
pub struct SignedUrlQuery {
    pub agent_id: Option<String>,
}

/// Fetches a signed conversation URL for the managed speech agent.
///
/// The upstream JSON is forwarded verbatim.
#[instrument(skip_all)]
pub async fn signed_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignedUrlQuery>,
) -> Result<Json<Value>, ApiError> {
    let agent_id = query
        .agent_id
        .filter(|id| !id.is_empty())
        .or_else(|| state.config.elevenlabs_agent_id.clone())
        .ok_or_else(|| ApiError::BadRequest("Missing agent_id".to_string()))?;
    let api_key = state
        .config
        .elevenlabs_api_key
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Server missing ELEVENLABS_API_KEY".to_string()))?;

    let fetch = async {
        let response = state
            .http
            .get(format!(
                "{}/v1/convai/conversation/get-signed-url",
                state.config.elevenlabs_api_base
            ))
            .query(&[("agent_id", agent_id.as_str())])
            .header("xi-api-key", api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok::<Value, anyhow::Error>(response.json().await?)
    };
    let data = fetch.await.map_err(|source| ApiError::Upstream {
        message: "Failed to fetch signed url",
        source,
    })?;

    info!(agent_id = %agent_id, "Issued signed url");
    Ok(Json(data))
}

#[derive(Deserialize, Debug, Default)]
pub struct ConnectQuery {
    pub model: Option<String>,
}

/// Proxies an SDP offer to the live model and forwards its answer, status
/// code included.
#[instrument(skip_all)]
pub async fn gemini_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    offer: String,
) -> Result<Response, ApiError> {
    let model = query
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.live_model.clone());
    let api_key = state.config.google_api_key.as_deref().ok_or_else(|| {
        ApiError::Misconfigured("Server missing GOOGLE_API_KEY (or GEMINI_API_KEY)".to_string())
    })?;

    let exchange = async {
        let method = format!("{model}:connect");
        let mut url = reqwest::Url::parse(&state.config.gemini_api_base)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("GEMINI_API_BASE cannot be a base url"))?
            .pop_if_empty()
            .extend(["v1beta", "models", method.as_str()]);

        let response = state
            .http
            .post(url)
            .query(&[("key", api_key)])
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer)
            .send()
            .await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(SDP_CONTENT_TYPE)
            .to_string();
        let body = response.text().await?;
        Ok::<_, anyhow::Error>((status, content_type, body))
    };
    let (status, content_type, body) = exchange.await.map_err(|source| ApiError::Upstream {
        message: "Failed to connect to Gemini Live",
        source,
    })?;

    info!(model = %model, status, "Forwarding session description answer");
    let response = Response::builder()
        .status(StatusCode::from_u16(status)?)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))?;
    Ok(response)
}
