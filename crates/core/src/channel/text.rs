//! The relay's local text-streaming socket, used as the fallback channel.

use super::{
    ChannelKind, ChannelStatus, InboundSender, TransportChannel, socket::SocketChannel,
};
use crate::{
    error::ConnectionError, normalizer::Framing, protocol::OutboundMessage, relay::RelayClient,
};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::instrument;

pub struct StreamingTextChannel {
    socket: SocketChannel,
}

impl StreamingTextChannel {
    pub fn new(relay: RelayClient, inbound: InboundSender) -> Self {
        Self {
            socket: SocketChannel::new(ChannelKind::StreamingText, Framing::Text, relay, inbound),
        }
    }
}

#[async_trait]
impl TransportChannel for StreamingTextChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::StreamingText
    }

    fn framing(&self) -> Framing {
        Framing::Text
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

    #[instrument(name = "text_connect", skip_all)]
    async fn connect(&self) -> Result<(), ConnectionError> {
        let url = self.socket.relay().chat_socket_url();
        // The relay sends its own `ready` frame.
        self.socket.connect_with(|| async move { Ok(url) }, false).await
    }

    fn disconnect(&self) {
        self.socket.disconnect();
    }

    async fn send(&self, message: &OutboundMessage) {
        self.socket.send_text(message.to_json());
    }
}
