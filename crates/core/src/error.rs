//! Error taxonomy for the session core.
//!
//! None of these are fatal to a session. Connection errors become channel
//! status changes, protocol errors drop a single frame, playback errors drop a
//! single audio chunk.

use std::time::Duration;

/// A channel could not be established (credential fetch, handshake, socket or media setup).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Relay request failed: {0}")]
    Relay(#[from] reqwest::Error),
    #[error("Relay returned status {status}: {message}")]
    RelayStatus { status: u16, message: String },
    #[error("No signed url in response")]
    MissingUrl,
    #[error("WebSocket handshake failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Media session failed: {0}")]
    Media(String),
    #[error("Microphone unavailable: {0}")]
    Microphone(String),
    #[error("Timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),
    #[error("Connection attempt was cancelled by disconnect")]
    Cancelled,
}

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError::Media(err.to_string())
    }
}

/// An inbound frame could not be turned into audio or a canonical event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("Frame is neither JSON nor base64 audio")]
    Unparseable,
    #[error("JSON frame has no string `type` field")]
    Untyped,
    #[error("Unknown event type `{0}`")]
    UnknownType(String),
    #[error("Malformed `{0}` event")]
    MalformedEvent(String),
    #[error("Empty audio payload")]
    EmptyAudio,
}

/// An audio chunk could not be played.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Audio decode failed: {0}")]
    Decode(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Playback has been released")]
    Released,
}
