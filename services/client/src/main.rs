//! Terminal client for a Parley session.
//!
//! Reads lines from stdin and sends them to the agent; everything the session
//! reports is printed as it happens. `/status` lists channel states and
//! `/quit` (or end of input) ends the session.

mod cli;
mod console;
mod microphone;
mod speaker;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Primary};
use microphone::CpalMicrophone;
use parley_core::{
    SessionOrchestrator, SessionUpdate, TransportChannel,
    audio::PEER_AUDIO_SAMPLE_RATE,
    channel::{
        InboundSender, inbound_channel,
        peer::{Microphone, PeerConfig, PeerMediaChannel, RemoteAudio, SilentMicrophone},
        speech::StreamingSpeechChannel,
        text::StreamingTextChannel,
    },
    playback::{AudioPlaybackScheduler, MulawDecoder, Pcm16Decoder},
    relay::RelayClient,
};
use speaker::SpeakerOutput;
use std::{io::Write, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

enum Input {
    Line(Option<String>),
    Updates(Option<Vec<SessionUpdate>>),
    Interrupt,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let relay = RelayClient::new(cli.relay_url.clone(), cli.timeout()).with_agent_id(cli.agent_id.clone());
    let (inbound_tx, inbound_rx) = inbound_channel();
    let (channels, remote_audio) = build_channels(&cli, relay.clone(), inbound_tx);

    let mut session = SessionOrchestrator::new(channels, inbound_rx);
    let mut remote_playback = None;
    if !cli.no_audio {
        session = session.with_playback(AudioPlaybackScheduler::new(
            SpeakerOutput,
            Pcm16Decoder::new(cli.sample_rate, 1),
        ));
        if let Some(packets) = remote_audio {
            remote_playback = Some(play_remote_audio(packets));
        }
    }
    session.add_listener(|update| {
        if let Some(text) = console::render(update) {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
        Ok(())
    });

    match relay.health().await {
        Ok(true) => debug!(relay = %cli.relay_url, "Relay is healthy"),
        Ok(false) => warn!(relay = %cli.relay_url, "Relay reports it is unhealthy"),
        Err(e) => warn!(relay = %cli.relay_url, error = %e, "Relay health check failed"),
    }
    info!(relay = %cli.relay_url, primary = ?cli.primary, "Starting session");
    let connecting = session.connect_preferred();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line.unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read stdin");
                None
            })),
            updates = session.next_update() => Input::Updates(updates),
            _ = &mut interrupt => Input::Interrupt,
        };

        match input {
            Input::Line(None) | Input::Interrupt | Input::Updates(None) => break,
            Input::Updates(Some(_)) => {}
            Input::Line(Some(line)) => match line.trim() {
                "/quit" => break,
                "/status" => {
                    for (channel, status) in session.statuses() {
                        println!("{channel}: {status}");
                    }
                }
                text => {
                    if let Some(sent) = session.send(text).await {
                        debug!(message = %sent.id, channel = ?sent.channel, "Message sent");
                    }
                }
            },
        }
    }

    connecting.abort();
    session.shutdown();
    if let Some((scheduler, pump)) = remote_playback {
        pump.abort();
        scheduler.close();
    }
    info!("Session ended");
    Ok(())
}

type RemoteAudioRx = mpsc::UnboundedReceiver<RemoteAudio>;

/// Channels in priority order. The text socket always comes last.
fn build_channels(
    cli: &Cli,
    relay: RelayClient,
    inbound: InboundSender,
) -> (Vec<Arc<dyn TransportChannel>>, Option<RemoteAudioRx>) {
    let mut channels: Vec<Arc<dyn TransportChannel>> = Vec::new();
    let mut remote_audio = None;
    match cli.primary {
        Primary::Speech => {
            channels.push(Arc::new(StreamingSpeechChannel::new(relay.clone(), inbound.clone())));
        }
        Primary::Peer => {
            let microphone: Arc<dyn Microphone> = if cli.no_audio {
                Arc::new(SilentMicrophone)
            } else {
                Arc::new(CpalMicrophone)
            };
            let config = PeerConfig {
                model: cli.model.clone(),
                ..PeerConfig::default()
            };
            let peer = Arc::new(PeerMediaChannel::new(relay.clone(), config, microphone, inbound.clone()));
            remote_audio = peer.take_remote_audio();
            channels.push(peer);
        }
        Primary::None => {}
    }
    channels.push(Arc::new(StreamingTextChannel::new(relay, inbound)));
    (channels, remote_audio)
}

/// Plays the peer's remote track through its own scheduler.
fn play_remote_audio(mut packets: RemoteAudioRx) -> (AudioPlaybackScheduler, JoinHandle<()>) {
    let scheduler = AudioPlaybackScheduler::new(
        SpeakerOutput,
        MulawDecoder {
            sample_rate: PEER_AUDIO_SAMPLE_RATE,
        },
    );
    let playback = scheduler.clone();
    let pump = tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            if !packet.mime_type.eq_ignore_ascii_case("audio/PCMU") {
                debug!(mime_type = %packet.mime_type, "Skipping remote packet with unsupported codec");
                continue;
            }
            playback.enqueue(packet.payload);
        }
    });
    (scheduler, pump)
}
