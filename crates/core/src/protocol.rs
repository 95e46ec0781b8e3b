//! Wire message shapes exchanged with the relay and upstream agents.
//!
//! Every JSON frame carries a `type` discriminant. The same types are used by
//! the relay's chat socket to produce frames and by the client to parse them.

use serde::{Deserialize, Serialize};

/// Event types the client understands, used to tell malformed frames from unknown ones.
pub const KNOWN_EVENT_TYPES: [&str; 5] = [
    "ready",
    "agent_response_delta",
    "agent_response_done",
    "transcript",
    "error",
];

/// Messages sent from the agent side to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// The agent session is ready to receive input.
    Ready,
    /// An incremental fragment of the assistant's reply.
    AgentResponseDelta { delta: String },
    /// The current assistant reply is complete.
    AgentResponseDone,
    /// A transcription of the user's speech.
    Transcript {
        text: String,
        #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
        is_final: Option<bool>,
    },
    /// An error reported by the agent.
    Error { error: String },
}

/// Messages sent from the client to the agent side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A text utterance from the user.
    UserMessage { text: String },
}

impl OutboundMessage {
    pub fn user(text: impl Into<String>) -> Self {
        OutboundMessage::UserMessage { text: text.into() }
    }

    pub fn to_json(&self) -> String {
        // Serializing a string-only enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The normalized, transport-independent form of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalEvent {
    AgentResponseDelta { text: String },
    AgentResponseDone,
    Transcript { text: String, is_final: bool },
    Error { reason: String },
    Ready,
}

impl From<InboundMessage> for CanonicalEvent {
    fn from(msg: InboundMessage) -> Self {
        match msg {
            InboundMessage::Ready => CanonicalEvent::Ready,
            InboundMessage::AgentResponseDelta { delta } => {
                CanonicalEvent::AgentResponseDelta { text: delta }
            }
            InboundMessage::AgentResponseDone => CanonicalEvent::AgentResponseDone,
            InboundMessage::Transcript { text, is_final } => CanonicalEvent::Transcript {
                text,
                is_final: is_final.unwrap_or(false),
            },
            InboundMessage::Error { error } => CanonicalEvent::Error { reason: error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_wire_shape() {
        let json = OutboundMessage::user("hi").to_json();
        assert_eq!(json, r#"{"type":"user_message","text":"hi"}"#);
    }

    #[test]
    fn test_inbound_serialization_matches_wire() {
        let delta = InboundMessage::AgentResponseDelta {
            delta: "Hel".into(),
        };
        assert_eq!(
            serde_json::to_string(&delta).unwrap(),
            r#"{"type":"agent_response_delta","delta":"Hel"}"#
        );
        assert_eq!(
            serde_json::to_string(&InboundMessage::AgentResponseDone).unwrap(),
            r#"{"type":"agent_response_done"}"#
        );
        let error = InboundMessage::Error {
            error: "Malformed message".into(),
        };
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"type":"error","error":"Malformed message"}"#
        );
    }

    #[test]
    fn test_transcript_final_defaults_to_false() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"transcript","text":"hey"}"#).unwrap();
        assert_eq!(
            CanonicalEvent::from(msg),
            CanonicalEvent::Transcript {
                text: "hey".into(),
                is_final: false
            }
        );

        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"transcript","text":"hey","final":true}"#).unwrap();
        assert_eq!(
            CanonicalEvent::from(msg),
            CanonicalEvent::Transcript {
                text: "hey".into(),
                is_final: true
            }
        );
    }
}
