//! The ordered message model and the streaming-turn rule.
//!
//! Only one assistant turn is live at a time. Deltas and `done` signals from a
//! channel other than the one that opened the live turn wait in a queue and
//! are replayed, in arrival order, once the live turn closes.

use crate::{channel::ChannelKind, session::SessionUpdate};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

/// The assistant message currently receiving deltas, and the channel feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingTurn {
    pub message_id: MessageId,
    pub source: ChannelKind,
}

#[derive(Debug, Clone)]
enum TurnSignal {
    Delta(String),
    Done,
}

#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    turn: Option<StreamingTurn>,
    pending: VecDeque<(ChannelKind, TurnSignal)>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn streaming_turn(&self) -> Option<StreamingTurn> {
        self.turn
    }

    /// Number of turn signals waiting for the live turn to close.
    #[cfg(test)]
    pub fn queued_signals(&self) -> usize {
        self.pending.len()
    }

    /// Appends a message that is complete on arrival (user input, system notes).
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> &Message {
        self.messages.push(Message {
            id: MessageId::new(),
            role,
            content: content.into(),
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn apply_delta(&mut self, source: ChannelKind, text: String) -> Vec<SessionUpdate> {
        self.pending.push_back((source, TurnSignal::Delta(text)));
        self.replay()
    }

    pub fn apply_done(&mut self, source: ChannelKind) -> Vec<SessionUpdate> {
        self.pending.push_back((source, TurnSignal::Done));
        self.replay()
    }

    /// Forgets a channel that went away: its queued signals are dropped, a
    /// turn it owns is closed, and other channels' queued signals replay.
    pub fn abandon(&mut self, source: ChannelKind) -> Vec<SessionUpdate> {
        self.pending.retain(|(queued, _)| *queued != source);
        let mut updates = Vec::new();
        if self.turn.is_some_and(|turn| turn.source == source) {
            self.close(&mut updates);
        }
        updates.extend(self.replay());
        updates
    }

    /// Applies queued signals that belong to the live turn's channel, or, when no
    /// turn is live, to the channel at the head of the queue.
    fn replay(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        loop {
            let owner = match (self.turn, self.pending.front()) {
                (Some(turn), _) => turn.source,
                (None, Some((source, _))) => *source,
                (None, None) => break,
            };
            let Some(pos) = self.pending.iter().position(|(source, _)| *source == owner) else {
                break;
            };
            let Some((_, signal)) = self.pending.remove(pos) else {
                break;
            };
            match signal {
                TurnSignal::Delta(text) => self.append(owner, text, &mut updates),
                TurnSignal::Done => self.close(&mut updates),
            }
        }
        updates
    }

    fn append(&mut self, source: ChannelKind, text: String, updates: &mut Vec<SessionUpdate>) {
        if let Some(turn) = self.turn {
            if let Some(message) = self
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.id == turn.message_id)
            {
                message.content.push_str(&text);
                updates.push(SessionUpdate::MessageUpdated {
                    id: turn.message_id,
                    delta: text,
                    content: message.content.clone(),
                });
                return;
            }
        }
        let id = self.push(Role::Assistant, text).id;
        self.turn = Some(StreamingTurn {
            message_id: id,
            source,
        });
        updates.push(SessionUpdate::MessageAppended(
            self.messages[self.messages.len() - 1].clone(),
        ));
    }

    fn close(&mut self, updates: &mut Vec<SessionUpdate>) {
        if let Some(turn) = self.turn.take() {
            updates.push(SessionUpdate::TurnClosed {
                id: turn.message_id,
            });
        }
    }
}
