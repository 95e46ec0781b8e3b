use clap::{Parser, ValueEnum};
use parley_core::{channel::peer::DEFAULT_PEER_MODEL, relay::DEFAULT_RELAY_URL};
use std::time::Duration;

/// Which channel is preferred; the relay's text socket is always the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Primary {
    /// Managed speech agent over a signed WebSocket.
    Speech,
    /// Live model over WebRTC.
    Peer,
    /// Text socket only.
    None,
}

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Talk to a realtime voice agent from the terminal", long_about = None)]
pub struct Cli {
    /// Base URL of the relay service
    #[arg(long, env = "PARLEY_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Preferred channel
    #[arg(long, value_enum, default_value_t = Primary::Speech)]
    pub primary: Primary,

    /// Speech agent id; the relay's configured agent is used when omitted
    #[arg(long, env = "PARLEY_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Live model used by the peer channel
    #[arg(long, default_value = DEFAULT_PEER_MODEL)]
    pub model: String,

    /// Bound on credential fetches, handshakes and socket opens
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: u64,

    /// Disable speaker and microphone
    #[arg(long)]
    pub no_audio: bool,

    /// Sample rate of raw PCM16 chunks from the speech agent
    #[arg(long, default_value_t = parley_core::audio::DEFAULT_SPEECH_SAMPLE_RATE)]
    pub sample_rate: u32,
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
