//! WebSocket plumbing shared by the speech and text channels.

use super::{
    ChannelKind, ChannelStatus, Inbound, InboundItem, InboundSender, status::StatusCell,
};
use crate::{
    error::ConnectionError,
    normalizer::{EventNormalizer, Framing, Normalized, RawFrame},
    protocol::CanonicalEvent,
    relay::RelayClient,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

/// State shared between a channel and the reader task of its current connection.
pub(crate) struct Shared {
    pub kind: ChannelKind,
    pub normalizer: EventNormalizer,
    pub status: StatusCell,
    pub generation: AtomicU64,
    pub inbound: InboundSender,
}

impl Shared {
    pub fn new(kind: ChannelKind, framing: Framing, inbound: InboundSender) -> Self {
        Self {
            kind,
            normalizer: EventNormalizer::new(framing),
            status: StatusCell::new(kind),
            generation: AtomicU64::new(0),
            inbound,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Invalidates the current connection. Returns the new generation.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Normalizes a frame and forwards anything useful, unless the connection is stale.
    pub fn forward(&self, generation: u64, frame: RawFrame) {
        let item = match self.normalizer.normalize(frame) {
            Normalized::Audio(data) => InboundItem::Audio(data),
            Normalized::Event(event) => InboundItem::Event(event),
            Normalized::Dropped(_) => return,
        };
        self.emit(generation, item);
    }

    pub fn emit(&self, generation: u64, item: InboundItem) {
        if !self.is_current(generation) {
            debug!(channel = %self.kind, "Discarding item from stale connection");
            return;
        }
        let _ = self.inbound.send(Inbound {
            channel: self.kind,
            generation,
            item,
        });
    }
}

struct Connection {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.reader.abort();
        let _ = self.outgoing.send(WsMessage::Close(None));
    }
}

/// One WebSocket connection slot with the connect/disconnect rules applied.
pub(crate) struct SocketChannel {
    pub shared: Arc<Shared>,
    relay: RelayClient,
    connection: Mutex<Option<Connection>>,
}

impl SocketChannel {
    pub fn new(kind: ChannelKind, framing: Framing, relay: RelayClient, inbound: InboundSender) -> Self {
        Self {
            shared: Arc::new(Shared::new(kind, framing, inbound)),
            relay,
            connection: Mutex::new(None),
        }
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    /// Runs a connect attempt: `resolve` produces the socket URL, then the
    /// socket is opened. When `announce_ready` is set a `ready` event is
    /// emitted as soon as the socket is open.
    pub async fn connect_with<F, Fut>(&self, resolve: F, announce_ready: bool) -> Result<(), ConnectionError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String, ConnectionError>>,
    {
        let shared = &self.shared;
        if !shared.status.begin_connect() {
            debug!(channel = %shared.kind, "Connect requested while already active");
            return Ok(());
        }
        let generation = shared.generation();

        let result = async {
            let url = resolve().await?;
            if !shared.is_current(generation) {
                return Err(ConnectionError::Cancelled);
            }
            self.open(&url, generation, announce_ready).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(channel = %shared.kind, "Channel connected");
                Ok(())
            }
            Err(e) => {
                if shared.is_current(generation) {
                    shared.status.fail();
                }
                warn!(channel = %shared.kind, error = %e, "Channel failed to connect");
                Err(e)
            }
        }
    }

    async fn open(&self, url: &str, generation: u64, announce_ready: bool) -> Result<(), ConnectionError> {
        let (ws_stream, _) = self
            .relay
            .bounded("opening socket", async { Ok(connect_async(url).await?) })
            .await?;
        if !self.shared.is_current(generation) {
            // Dropping the stream closes the socket.
            return Err(ConnectionError::Cancelled);
        }

        let (mut sink, mut stream) = ws_stream.split();
        self.shared.status.connected();
        if announce_ready {
            self.shared
                .emit(generation, InboundItem::Event(CanonicalEvent::Ready));
        }
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = stream.next().await {
                match msg_result {
                    Ok(WsMessage::Text(text)) => {
                        shared.forward(generation, RawFrame::Text(text.as_str().to_owned()))
                    }
                    Ok(WsMessage::Binary(data)) => shared.forward(generation, RawFrame::Binary(data)),
                    Ok(WsMessage::Close(frame)) => {
                        info!(channel = %shared.kind, ?frame, "Socket closed by server");
                        if shared.is_current(generation) {
                            shared.status.closed();
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %shared.kind, error = %e, "Socket error");
                        if shared.is_current(generation) {
                            shared.status.fail();
                        }
                        return;
                    }
                }
            }
            if shared.is_current(generation) && shared.status.get() == ChannelStatus::Connected {
                shared.status.closed();
            }
        });

        self.store(Connection { outgoing, reader }, generation)
    }

    /// Installs `connection` in the slot unless a disconnect has made
    /// `generation` stale, in which case the connection is closed.
    fn store(&self, connection: Connection, generation: u64) -> Result<(), ConnectionError> {
        let stale = {
            let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = slot.replace(connection) {
                previous.close();
            }
            if self.shared.is_current(generation) {
                None
            } else {
                slot.take()
            }
        };
        match stale {
            Some(stale) => {
                stale.close();
                Err(ConnectionError::Cancelled)
            }
            None => Ok(()),
        }
    }

    pub fn send_text(&self, text: String) {
        if self.shared.status.get() != ChannelStatus::Connected {
            debug!(channel = %self.shared.kind, "Send skipped, channel not connected");
            return;
        }
        let guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = guard.as_ref() {
            let _ = connection.outgoing.send(WsMessage::Text(text.into()));
        }
    }

    pub fn disconnect(&self) {
        self.shared.bump();
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.close();
            info!(channel = %self.shared.kind, "Channel disconnected");
        }
        self.shared.status.reset();
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
