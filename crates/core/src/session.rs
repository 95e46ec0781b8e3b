//! The session orchestrator: one conversation fed by an ordered set of channels.
//!
//! Channels are given in priority order; the last one is the fallback. All of
//! them connect concurrently, outgoing messages take the first connected
//! channel, and everything that comes back is turned into [`SessionUpdate`]s
//! published to listeners in order.

use crate::{
    channel::{ChannelKind, ChannelStatus, Inbound, InboundItem, InboundReceiver, TransportChannel},
    conversation::{Conversation, Message, MessageId, Role, StreamingTurn},
    listeners::{ListenerId, ListenerRegistry},
    playback::AudioPlaybackScheduler,
    protocol::{CanonicalEvent, OutboundMessage},
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// What listeners are told about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    MessageAppended(Message),
    MessageUpdated {
        id: MessageId,
        delta: String,
        content: String,
    },
    TurnClosed {
        id: MessageId,
    },
    Transcript {
        channel: ChannelKind,
        text: String,
        is_final: bool,
    },
    /// An upstream error surfaced to the user; the conversation carries on.
    Notice {
        channel: ChannelKind,
        reason: String,
    },
    Status {
        channel: ChannelKind,
        status: ChannelStatus,
    },
    Ready {
        channel: ChannelKind,
    },
}

/// The locally echoed user message and the channel it was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub id: MessageId,
    pub channel: Option<ChannelKind>,
}

pub struct SessionOrchestrator {
    channels: Vec<Arc<dyn TransportChannel>>,
    inbound: InboundReceiver,
    status_rx: mpsc::UnboundedReceiver<(ChannelKind, ChannelStatus)>,
    status_watchers: Vec<JoinHandle<()>>,
    conversation: Conversation,
    listeners: ListenerRegistry<SessionUpdate>,
    playback: Option<AudioPlaybackScheduler>,
    shut_down: bool,
}

impl SessionOrchestrator {
    /// `channels` in priority order, all feeding `inbound`. Must be called
    /// from within a tokio runtime.
    pub fn new(channels: Vec<Arc<dyn TransportChannel>>, inbound: InboundReceiver) -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let status_watchers = channels
            .iter()
            .map(|channel| {
                let kind = channel.kind();
                let mut watch = channel.watch_status();
                let status_tx = status_tx.clone();
                tokio::spawn(async move {
                    while watch.changed().await.is_ok() {
                        let status = *watch.borrow_and_update();
                        if status_tx.send((kind, status)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            channels,
            inbound,
            status_rx,
            status_watchers,
            conversation: Conversation::new(),
            listeners: ListenerRegistry::new(),
            playback: None,
            shut_down: false,
        }
    }

    /// Inbound audio is handed to `scheduler`; without one it is discarded.
    pub fn with_playback(mut self, scheduler: AudioPlaybackScheduler) -> Self {
        self.playback = Some(scheduler);
        self
    }

    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&SessionUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn streaming_turn(&self) -> Option<StreamingTurn> {
        self.conversation.streaming_turn()
    }

    pub fn statuses(&self) -> Vec<(ChannelKind, ChannelStatus)> {
        self.channels.iter().map(|c| (c.kind(), c.status())).collect()
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&Arc<dyn TransportChannel>> {
        self.channels.iter().find(|c| c.kind() == kind)
    }

    /// Connects every channel concurrently. Failures end up as channel status,
    /// never as an error here.
    pub fn connect_preferred(&self) -> JoinHandle<()> {
        let channels = self.channels.clone();
        tokio::spawn(async move {
            let attempts = channels.iter().map(|channel| async move {
                if let Err(e) = channel.connect().await {
                    warn!(channel = %channel.kind(), error = %e, "Connect attempt failed");
                }
            });
            join_all(attempts).await;
        })
    }

    /// The channel an outgoing message would take right now.
    pub fn route(&self) -> Option<&Arc<dyn TransportChannel>> {
        self.channels
            .iter()
            .find(|c| c.status() == ChannelStatus::Connected)
            .or_else(|| self.channels.last())
    }

    /// Echoes the trimmed text as a user message and sends it on the routed
    /// channel. Blank input is ignored.
    pub async fn send(&mut self, text: &str) -> Option<SentMessage> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let message = self.conversation.push(Role::User, text).clone();
        let id = message.id;
        self.publish(&[SessionUpdate::MessageAppended(message)]);

        let channel = self.route().cloned();
        let kind = channel.as_ref().map(|c| c.kind());
        match channel {
            Some(channel) => {
                debug!(channel = %channel.kind(), status = %channel.status(), "Routing user message");
                channel.send(&OutboundMessage::user(text)).await;
            }
            None => warn!("No channel to route user message to"),
        }
        Some(SentMessage { id, channel: kind })
    }

    /// Applies one canonical event from `channel` and publishes the result.
    pub fn on_event(&mut self, channel: ChannelKind, event: CanonicalEvent) -> Vec<SessionUpdate> {
        let updates = match event {
            CanonicalEvent::AgentResponseDelta { text } => self.conversation.apply_delta(channel, text),
            CanonicalEvent::AgentResponseDone => self.conversation.apply_done(channel),
            CanonicalEvent::Transcript { text, is_final } => vec![SessionUpdate::Transcript {
                channel,
                text,
                is_final,
            }],
            CanonicalEvent::Error { reason } => {
                warn!(channel = %channel, reason = %reason, "Agent reported an error");
                vec![SessionUpdate::Notice { channel, reason }]
            }
            CanonicalEvent::Ready => {
                info!(channel = %channel, "Agent ready");
                vec![SessionUpdate::Ready { channel }]
            }
        };
        self.publish(&updates);
        updates
    }

    /// Waits for the next inbound item or status change and applies it.
    /// Returns `None` once every source has closed.
    pub async fn next_update(&mut self) -> Option<Vec<SessionUpdate>> {
        tokio::select! {
            Some(inbound) = self.inbound.recv() => Some(self.handle_inbound(inbound)),
            Some((channel, status)) = self.status_rx.recv() => Some(self.on_status(channel, status)),
            else => None,
        }
    }

    /// Publishes a status change. A channel that dropped to idle or error
    /// gives up its live turn so other channels' replies are not held back.
    fn on_status(&mut self, channel: ChannelKind, status: ChannelStatus) -> Vec<SessionUpdate> {
        let mut updates = vec![SessionUpdate::Status { channel, status }];
        if matches!(status, ChannelStatus::Idle | ChannelStatus::Error) {
            updates.extend(self.conversation.abandon(channel));
        }
        self.publish(&updates);
        updates
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> Vec<SessionUpdate> {
        let current = self
            .channel(inbound.channel)
            .map(|c| c.generation() == inbound.generation)
            .unwrap_or(false);
        if !current {
            debug!(channel = %inbound.channel, generation = inbound.generation, "Discarding stale inbound item");
            return Vec::new();
        }

        match inbound.item {
            InboundItem::Audio(data) => {
                match &self.playback {
                    Some(playback) => {
                        playback.enqueue(data);
                    }
                    None => debug!(bytes = data.len(), "No playback configured, dropping audio"),
                }
                Vec::new()
            }
            InboundItem::Event(event) => self.on_event(inbound.channel, event),
        }
    }

    fn publish(&self, updates: &[SessionUpdate]) {
        for update in updates {
            self.listeners.emit(update);
        }
    }

    /// Disconnects every channel and closes any turn they left open. Safe to repeat.
    pub fn disconnect(&mut self) {
        let mut updates = Vec::new();
        for channel in &self.channels {
            channel.disconnect();
            updates.extend(self.conversation.abandon(channel.kind()));
        }
        self.publish(&updates);
    }

    /// Disconnects and releases the playback device. Runs once; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.disconnect();
        if let Some(playback) = &self.playback {
            playback.close();
        }
        for watcher in self.status_watchers.drain(..) {
            watcher.abort();
        }
        info!("Session shut down");
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
