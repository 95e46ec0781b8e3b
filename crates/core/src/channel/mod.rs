//! Transport channels to the remote agent.
//!
//! Each channel owns one physical connection and its lifecycle:
//!
//! - `speech`: duplex WebSocket to the managed speech agent, URL issued by the relay.
//! - `text`: the relay's local text-streaming socket, used as the fallback.
//! - `peer`: WebRTC media session whose offer/answer goes through the relay.
//!
//! Channels normalize their own inbound frames and forward the results to the
//! session over an [`InboundSender`], tagged with the connection generation.

pub mod peer;
mod socket;
pub mod speech;
pub mod status;
pub mod text;

use crate::{
    error::ConnectionError,
    normalizer::Framing,
    protocol::{CanonicalEvent, OutboundMessage},
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    StreamingSpeech,
    PeerMedia,
    StreamingText,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::StreamingSpeech => write!(f, "streaming_speech"),
            ChannelKind::PeerMedia => write!(f, "peer_media"),
            ChannelKind::StreamingText => write!(f, "streaming_text"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Idle => write!(f, "Idle"),
            ChannelStatus::Connecting => write!(f, "Connecting…"),
            ChannelStatus::Connected => write!(f, "Connected"),
            ChannelStatus::Error => write!(f, "Error"),
        }
    }
}

/// A normalized inbound item, attributed to the channel and connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub channel: ChannelKind,
    pub generation: u64,
    pub item: InboundItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    Audio(Bytes),
    Event(CanonicalEvent),
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Creates the queue channels use to hand inbound items to the session.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn framing(&self) -> Framing;

    fn status(&self) -> ChannelStatus;

    fn watch_status(&self) -> watch::Receiver<ChannelStatus>;

    /// Bumped on every disconnect. Inbound items from older generations are stale.
    fn generation(&self) -> u64;

    /// Establishes the connection. A no-op if already connecting or connected.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Tears the connection down. Idempotent and safe from any state; once it
    /// returns no further inbound items are attributed to the old connection.
    fn disconnect(&self);

    /// Best-effort delivery; silently does nothing unless connected.
    async fn send(&self, message: &OutboundMessage);
}
