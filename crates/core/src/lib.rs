//! Client-side core of a realtime voice and text agent session.
//!
//! A [`session::SessionOrchestrator`] owns an ordered list of transport
//! channels (streaming speech, peer media, streaming text), turns their
//! inbound frames into one ordered conversation, and hands inbound audio to an
//! [`playback::AudioPlaybackScheduler`] for gapless playback.

pub mod audio;
pub mod channel;
pub mod conversation;
pub mod error;
pub mod listeners;
pub mod normalizer;
pub mod playback;
pub mod protocol;
pub mod relay;
pub mod session;

pub use channel::{ChannelKind, ChannelStatus, TransportChannel};
pub use session::{SessionOrchestrator, SessionUpdate};
