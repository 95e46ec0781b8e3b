//! Turns raw channel frames into audio, canonical events, or nothing.
//!
//! Resolution order is fixed: binary audio (on binary-framed transports), then
//! JSON, then base64 audio, then drop. Every frame resolves to exactly one of
//! the three outcomes and nothing here panics.

use crate::{
    error::ProtocolError,
    protocol::{CanonicalEvent, InboundMessage, KNOWN_EVENT_TYPES},
};
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

/// One physical frame as received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

/// How a transport frames binary payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every binary frame is exactly one encoded audio chunk.
    Binary,
    /// Binary frames carry UTF-8 text.
    Text,
}

/// Result of normalizing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Audio(Bytes),
    Event(CanonicalEvent),
    Dropped(ProtocolError),
}

#[derive(Debug, Clone, Copy)]
pub struct EventNormalizer {
    framing: Framing,
}

impl EventNormalizer {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn normalize(&self, frame: RawFrame) -> Normalized {
        let result = match (frame, self.framing) {
            (RawFrame::Binary(data), Framing::Binary) => {
                if data.is_empty() {
                    Normalized::Dropped(ProtocolError::EmptyAudio)
                } else {
                    Normalized::Audio(data)
                }
            }
            (RawFrame::Binary(data), Framing::Text) => match std::str::from_utf8(&data) {
                Ok(text) => normalize_text(text),
                Err(_) => Normalized::Dropped(ProtocolError::InvalidUtf8),
            },
            (RawFrame::Text(text), _) => normalize_text(&text),
        };
        if let Normalized::Dropped(reason) = &result {
            debug!(%reason, "Dropping inbound frame");
        }
        result
    }
}

fn normalize_text(text: &str) -> Normalized {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => normalize_json(value),
        Err(_) => match decode_base64_audio(text) {
            Some(audio) if audio.is_empty() => Normalized::Dropped(ProtocolError::EmptyAudio),
            Some(audio) => Normalized::Audio(audio),
            None => Normalized::Dropped(ProtocolError::Unparseable),
        },
    }
}

fn normalize_json(value: serde_json::Value) -> Normalized {
    let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
        return Normalized::Dropped(ProtocolError::Untyped);
    };
    match InboundMessage::deserialize(value) {
        Ok(msg) => Normalized::Event(msg.into()),
        Err(_) if KNOWN_EVENT_TYPES.contains(&kind.as_str()) => {
            Normalized::Dropped(ProtocolError::MalformedEvent(kind))
        }
        Err(_) => Normalized::Dropped(ProtocolError::UnknownType(kind)),
    }
}

/// Decodes a base64 audio string, accepting a data-URL prefix such as
/// `data:audio/mpeg;base64,`.
fn decode_base64_audio(text: &str) -> Option<Bytes> {
    let payload = match text.find(',') {
        Some(idx) => &text[idx + 1..],
        None => text,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
        .map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawFrame {
        RawFrame::Text(s.to_string())
    }

    #[test]
    fn test_binary_frames_are_audio_on_binary_transport() {
        let normalizer = EventNormalizer::new(Framing::Binary);
        let frame = RawFrame::Binary(Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(
            normalizer.normalize(frame),
            Normalized::Audio(Bytes::from_static(&[1, 2, 3, 4]))
        );
        assert_eq!(
            normalizer.normalize(RawFrame::Binary(Bytes::new())),
            Normalized::Dropped(ProtocolError::EmptyAudio)
        );
    }

    #[test]
    fn test_binary_frames_are_text_on_text_transport() {
        let normalizer = EventNormalizer::new(Framing::Text);
        let frame = RawFrame::Binary(Bytes::from_static(br#"{"type":"ready"}"#));
        assert_eq!(
            normalizer.normalize(frame),
            Normalized::Event(CanonicalEvent::Ready)
        );
        let invalid = RawFrame::Binary(Bytes::from_static(&[0xff, 0xfe, 0x00]));
        assert_eq!(
            normalizer.normalize(invalid),
            Normalized::Dropped(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_recognized_events() {
        let normalizer = EventNormalizer::new(Framing::Binary);
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"agent_response_delta","delta":"Hel"}"#)),
            Normalized::Event(CanonicalEvent::AgentResponseDelta { text: "Hel".into() })
        );
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"agent_response_done"}"#)),
            Normalized::Event(CanonicalEvent::AgentResponseDone)
        );
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"transcript","text":"hi","final":true}"#)),
            Normalized::Event(CanonicalEvent::Transcript {
                text: "hi".into(),
                is_final: true
            })
        );
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"error","error":"quota"}"#)),
            Normalized::Event(CanonicalEvent::Error {
                reason: "quota".into()
            })
        );
    }

    #[test]
    fn test_malformed_and_unknown_json_is_dropped() {
        let normalizer = EventNormalizer::new(Framing::Text);
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"agent_response_delta","delta":5}"#)),
            Normalized::Dropped(ProtocolError::MalformedEvent(
                "agent_response_delta".into()
            ))
        );
        assert_eq!(
            normalizer.normalize(text(r#"{"type":"ping_event"}"#)),
            Normalized::Dropped(ProtocolError::UnknownType("ping_event".into()))
        );
        assert_eq!(
            normalizer.normalize(text("[1,2,3]")),
            Normalized::Dropped(ProtocolError::Untyped)
        );
        assert_eq!(
            normalizer.normalize(text("42")),
            Normalized::Dropped(ProtocolError::Untyped)
        );
    }

    #[test]
    fn test_bad_json_falls_back_to_base64_then_drop() {
        let normalizer = EventNormalizer::new(Framing::Text);
        let encoded = base64::engine::general_purpose::STANDARD.encode([0u8, 64, 0, 128]);
        assert_eq!(
            normalizer.normalize(text(&encoded)),
            Normalized::Audio(Bytes::from_static(&[0, 64, 0, 128]))
        );

        let data_url = format!("data:audio/wav;base64,{}", encoded);
        assert_eq!(
            normalizer.normalize(text(&data_url)),
            Normalized::Audio(Bytes::from_static(&[0, 64, 0, 128]))
        );

        assert_eq!(
            normalizer.normalize(text("{bad")),
            Normalized::Dropped(ProtocolError::Unparseable)
        );
        assert_eq!(
            normalizer.normalize(text("")),
            Normalized::Dropped(ProtocolError::EmptyAudio)
        );
    }

    #[test]
    fn test_every_input_resolves_to_one_outcome() {
        let inputs: Vec<RawFrame> = vec![
            text("{bad"),
            text("null"),
            text(r#"{"type":null}"#),
            text("not base64 at all!"),
            text(",,,"),
            text("data:,"),
            RawFrame::Binary(Bytes::from_static(&[0xc3, 0x28])),
            RawFrame::Binary(Bytes::from(vec![0u8; 4096])),
        ];
        for framing in [Framing::Binary, Framing::Text] {
            let normalizer = EventNormalizer::new(framing);
            for input in &inputs {
                match normalizer.normalize(input.clone()) {
                    Normalized::Audio(_) | Normalized::Event(_) | Normalized::Dropped(_) => {}
                }
            }
        }
    }
}
