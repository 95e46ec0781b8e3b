//! Duplex WebSocket to the managed speech agent.
//!
//! The socket URL is short-lived and issued by the relay, so the agent's API
//! key never reaches the client. Binary frames are audio chunks.

use super::{
    ChannelKind, ChannelStatus, InboundSender, TransportChannel, socket::SocketChannel,
};
use crate::{
    error::ConnectionError, normalizer::Framing, protocol::OutboundMessage, relay::RelayClient,
};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::instrument;

pub struct StreamingSpeechChannel {
    socket: SocketChannel,
}

impl StreamingSpeechChannel {
    pub fn new(relay: RelayClient, inbound: InboundSender) -> Self {
        Self {
            socket: SocketChannel::new(ChannelKind::StreamingSpeech, Framing::Binary, relay, inbound),
        }
    }
}

#[async_trait]
impl TransportChannel for StreamingSpeechChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::StreamingSpeech
    }

    fn framing(&self) -> Framing {
        Framing::Binary
    }

    fn status(&self) -> ChannelStatus {
        self.socket.shared.status.get()
    }

    fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.socket.shared.status.subscribe()
    }

    fn generation(&self) -> u64 {
        self.socket.shared.generation()
    }

    #[instrument(name = "speech_connect", skip_all)]
    async fn connect(&self) -> Result<(), ConnectionError> {
        let relay = self.socket.relay().clone();
        self.socket
            .connect_with(|| async move { relay.signed_url().await }, true)
            .await
    }

    fn disconnect(&self) {
        self.socket.disconnect();
    }

    async fn send(&self, message: &OutboundMessage) {
        self.socket.send_text(message.to_json());
    }
}
