//! WebRTC media session with the live speech model.
//!
//! The offer/answer exchange goes through the relay. Microphone audio is sent
//! as a G.711 mu-law track, remote audio arrives on its own track, and JSON
//! events travel over the `events` data channel.

use super::{
    ChannelKind, ChannelStatus, InboundSender, TransportChannel, socket::Shared,
};
use crate::{
    error::ConnectionError,
    normalizer::{Framing, RawFrame},
    protocol::OutboundMessage,
    relay::RelayClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};
use webrtc::{
    api::{
        APIBuilder,
        interceptor_registry::register_default_interceptors,
        media_engine::{MIME_TYPE_PCMU, MediaEngine},
    },
    data_channel::{
        RTCDataChannel, data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState,
    },
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::{
        RTCRtpTransceiverInit, rtp_codec::RTCRtpCodecCapability, rtp_codec::RTPCodecType,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
    },
    track::{
        track_local::{TrackLocal, track_local_static_sample::TrackLocalStaticSample},
        track_remote::TrackRemote,
    },
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_PEER_MODEL: &str = "gemini-2.0-flash-live-001";
pub const EVENTS_CHANNEL_LABEL: &str = "events";
/// Duration of one microphone frame handed to the send track.
pub const MIC_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Source of 8 kHz mu-law microphone frames, one [`MIC_FRAME_DURATION`] each.
///
/// Capture stops when the returned receiver is dropped.
pub trait Microphone: Send + Sync {
    fn open(&self) -> Result<mpsc::Receiver<Bytes>, ConnectionError>;
}

/// Sends mu-law silence at the real-time frame rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentMicrophone;

impl Microphone for SilentMicrophone {
    fn open(&self) -> Result<mpsc::Receiver<Bytes>, ConnectionError> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let frame = Bytes::from(vec![0xffu8; crate::audio::PEER_FRAME_SAMPLES]);
            let mut ticker = tokio::time::interval(MIC_FRAME_DURATION);
            loop {
                ticker.tick().await;
                if tx.send(frame.clone()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// One RTP payload from the remote audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudio {
    pub mime_type: String,
    pub clock_rate: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub model: String,
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_PEER_MODEL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

struct Session {
    pc: Arc<RTCPeerConnection>,
    events: Option<Arc<RTCDataChannel>>,
    microphone: Option<JoinHandle<()>>,
}

impl Session {
    fn close(self) {
        if let Some(microphone) = self.microphone {
            microphone.abort();
        }
        let pc = self.pc;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        debug!(error = %e, "Peer connection close failed");
                    }
                });
            }
            Err(_) => debug!("No runtime to close peer connection on"),
        }
    }
}

pub struct PeerMediaChannel {
    shared: Arc<Shared>,
    relay: RelayClient,
    config: PeerConfig,
    microphone: Arc<dyn Microphone>,
    session: Mutex<Option<Session>>,
    remote_tx: mpsc::UnboundedSender<RemoteAudio>,
    remote_rx: Mutex<Option<mpsc::UnboundedReceiver<RemoteAudio>>>,
}

/// Mirrors the peer connection's state onto the channel status while
/// `generation` is still the live connection.
fn apply_peer_state(shared: &Shared, generation: u64, state: RTCPeerConnectionState) {
    debug!(channel = %shared.kind, ?state, "Peer connection state changed");
    if !shared.is_current(generation) {
        return;
    }
    match state {
        RTCPeerConnectionState::Failed => {
            shared.status.fail();
        }
        RTCPeerConnectionState::Closed => {
            shared.status.closed();
        }
        _ => {}
    }
}

impl PeerMediaChannel {
    pub fn new(
        relay: RelayClient,
        config: PeerConfig,
        microphone: Arc<dyn Microphone>,
        inbound: InboundSender,
    ) -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared::new(ChannelKind::PeerMedia, Framing::Text, inbound)),
            relay,
            config,
            microphone,
            session: Mutex::new(None),
            remote_tx,
            remote_rx: Mutex::new(Some(remote_rx)),
        }
    }

    /// Stream of remote audio packets across all connections. Can be taken once.
    pub fn take_remote_audio(&self) -> Option<mpsc::UnboundedReceiver<RemoteAudio>> {
        self.remote_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn build_peer_connection(&self) -> Result<RTCPeerConnection, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        Ok(api.new_peer_connection(rtc_config).await?)
    }

    async fn establish(&self, generation: u64) -> Result<Session, ConnectionError> {
        let pc = Arc::new(self.build_peer_connection().await?);
        let mut session = Session {
            pc,
            events: None,
            microphone: None,
        };
        match self.negotiate(&mut session, generation).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    async fn negotiate(&self, session: &mut Session, generation: u64) -> Result<(), ConnectionError> {
        let pc = session.pc.clone();

        let shared = self.shared.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            apply_peer_state(&shared, generation, state);
            Box::pin(async {})
        }));

        let shared = self.shared.clone();
        let remote_tx = self.remote_tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let shared = shared.clone();
            let remote_tx = remote_tx.clone();
            Box::pin(async move {
                if track.kind() == RTPCodecType::Audio {
                    tokio::spawn(read_remote_audio(track, shared, remote_tx, generation));
                }
            })
        }));

        // Microphone first: without it there is no session.
        let frames = self.microphone.open()?;
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            "microphone".to_owned(),
            "parley".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        session.microphone = Some(tokio::spawn(pump_microphone(frames, track)));

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let events = pc.create_data_channel(EVENTS_CHANNEL_LABEL, None).await?;
        let shared = self.shared.clone();
        events.on_message(Box::new(move |msg: DataChannelMessage| {
            shared.forward(generation, RawFrame::Binary(msg.data));
            Box::pin(async {})
        }));
        session.events = Some(events);

        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        self.relay
            .bounded("gathering ice candidates", async {
                let _ = gather_complete.recv().await;
                Ok(())
            })
            .await?;
        let offer_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| ConnectionError::Media("no local description".into()))?
            .sdp;

        let answer_sdp = self.relay.exchange_sdp(&self.config.model, &offer_sdp).await?;
        if !self.shared.is_current(generation) {
            return Err(ConnectionError::Cancelled);
        }
        pc.set_remote_description(RTCSessionDescription::answer(answer_sdp)?)
            .await?;
        Ok(())
    }
}

async fn pump_microphone(mut frames: mpsc::Receiver<Bytes>, track: Arc<TrackLocalStaticSample>) {
    while let Some(frame) = frames.recv().await {
        let sample = Sample {
            data: frame,
            duration: MIC_FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(error = %e, "Microphone frame not written");
        }
    }
    debug!("Microphone stream ended");
}

async fn read_remote_audio(
    track: Arc<TrackRemote>,
    shared: Arc<Shared>,
    remote_tx: mpsc::UnboundedSender<RemoteAudio>,
    generation: u64,
) {
    let codec = track.codec();
    let mime_type = codec.capability.mime_type.clone();
    let clock_rate = codec.capability.clock_rate;
    info!(channel = %shared.kind, mime_type = %mime_type, clock_rate, "Remote audio track started");

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if !shared.is_current(generation) {
                    break;
                }
                if packet.payload.is_empty() {
                    continue;
                }
                let audio = RemoteAudio {
                    mime_type: mime_type.clone(),
                    clock_rate,
                    payload: packet.payload,
                };
                if remote_tx.send(audio).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(channel = %shared.kind, error = %e, "Remote track read ended");
                break;
            }
        }
    }
}

#[async_trait]
impl TransportChannel for PeerMediaChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::PeerMedia
    }

    fn framing(&self) -> Framing {
        Framing::Text
    }

    fn status(&self) -> ChannelStatus {
        self.shared.status.get()
    }

    fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    fn generation(&self) -> u64 {
        self.shared.generation()
    }

    #[instrument(name = "peer_connect", skip_all, fields(model = %self.config.model))]
    async fn connect(&self) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        if !shared.status.begin_connect() {
            debug!(channel = %shared.kind, "Connect requested while already active");
            return Ok(());
        }
        let generation = shared.generation();

        match self.establish(generation).await {
            Ok(session) if shared.is_current(generation) => {
                shared.status.connected();
                let previous = self
                    .session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(session);
                if let Some(previous) = previous {
                    previous.close();
                }
                info!(channel = %shared.kind, "Channel connected");
                Ok(())
            }
            Ok(session) => {
                session.close();
                Err(ConnectionError::Cancelled)
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

    fn disconnect(&self) {
        self.shared.bump();
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.close();
            info!(channel = %self.shared.kind, "Channel disconnected");
        }
        self.shared.status.reset();
    }

    async fn send(&self, message: &OutboundMessage) {
        if self.shared.status.get() != ChannelStatus::Connected {
            debug!(channel = %self.shared.kind, "Send skipped, channel not connected");
            return;
        }
        let events = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.events.clone());
        let Some(events) = events else {
            return;
        };
        if events.ready_state() != RTCDataChannelState::Open {
            debug!(channel = %self.shared.kind, "Send skipped, data channel not open");
            return;
        }
        if let Err(e) = events.send_text(message.to_json()).await {
            warn!(channel = %self.shared.kind, error = %e, "Data channel send failed");
        }
    }
}

impl Drop for PeerMediaChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::inbound_channel, relay::DEFAULT_TIMEOUT};
    use axum::{Router, http::StatusCode, routing::post};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts opens and reports whether capture is still being consumed.
    #[derive(Default)]
    struct FakeMicrophone {
        opens: AtomicUsize,
        fail: bool,
        last: Mutex<Option<mpsc::Sender<Bytes>>>,
    }

    impl Microphone for FakeMicrophone {
        fn open(&self) -> Result<mpsc::Receiver<Bytes>, ConnectionError> {
            if self.fail {
                return Err(ConnectionError::Microphone("permission denied".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(4);
            *self.last.lock().unwrap() = Some(tx);
            Ok(rx)
        }
    }

    impl FakeMicrophone {
        fn capture_stopped(&self) -> bool {
            self.last.lock().unwrap().as_ref().is_none_or(|tx| tx.is_closed())
        }
    }

    fn local_config() -> PeerConfig {
        PeerConfig {
            model: "test-model".into(),
            ice_servers: vec![],
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Plays the remote side of the exchange with a second local peer.
    async fn answer(offer: String) -> String {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.set_remote_description(RTCSessionDescription::offer(offer).unwrap())
            .await
            .unwrap();
        let answer = pc.create_answer(None).await.unwrap();
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.unwrap();
        let _ = gather_complete.recv().await;
        let sdp = pc.local_description().await.unwrap().sdp;
        // Keep the answering side alive for the rest of the test.
        std::mem::forget(pc);
        sdp
    }

    #[tokio::test]
    async fn test_connect_applies_answer() {
        let base = serve(Router::new().route("/gemini/connect", post(answer))).await;
        let microphone = Arc::new(FakeMicrophone::default());
        let (tx, _rx) = inbound_channel();
        let channel = PeerMediaChannel::new(
            RelayClient::new(base, DEFAULT_TIMEOUT),
            local_config(),
            microphone.clone(),
            tx,
        );
        assert!(channel.take_remote_audio().is_some());
        assert!(channel.take_remote_audio().is_none());

        channel.connect().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Connected);
        assert_eq!(microphone.opens.load(Ordering::SeqCst), 1);
        assert!(!microphone.capture_stopped());

        // Data channel may not be open yet; sending must not fail either way.
        channel.send(&OutboundMessage::user("hi")).await;

        channel.disconnect();
        assert_eq!(channel.status(), ChannelStatus::Idle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(microphone.capture_stopped());
    }

    #[tokio::test]
    async fn test_relay_failure_moves_to_error_and_stops_microphone() {
        let base = serve(Router::new().route(
            "/gemini/connect",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream down") }),
        ))
        .await;
        let microphone = Arc::new(FakeMicrophone::default());
        let (tx, _rx) = inbound_channel();
        let channel = PeerMediaChannel::new(
            RelayClient::new(base, DEFAULT_TIMEOUT),
            local_config(),
            microphone.clone(),
            tx,
        );

        match channel.connect().await {
            Err(ConnectionError::RelayStatus { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(channel.status(), ChannelStatus::Error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(microphone.capture_stopped());

        channel.disconnect();
        assert_eq!(channel.status(), ChannelStatus::Idle);
    }

    #[tokio::test]
    async fn test_microphone_denied_is_connection_error() {
        let microphone = Arc::new(FakeMicrophone {
            fail: true,
            ..Default::default()
        });
        let (tx, _rx) = inbound_channel();
        let channel = PeerMediaChannel::new(
            RelayClient::new("http://127.0.0.1:9", DEFAULT_TIMEOUT),
            local_config(),
            microphone,
            tx,
        );
        let mut status = channel.watch_status();

        assert!(matches!(
            channel.connect().await,
            Err(ConnectionError::Microphone(_))
        ));
        assert_eq!(*status.borrow_and_update(), ChannelStatus::Error);
    }

    #[tokio::test]
    async fn test_send_while_idle_is_noop() {
        let (tx, _rx) = inbound_channel();
        let channel = PeerMediaChannel::new(
            RelayClient::new("http://127.0.0.1:9", DEFAULT_TIMEOUT),
            PeerConfig::default(),
            Arc::new(SilentMicrophone),
            tx,
        );
        channel.send(&OutboundMessage::user("hi")).await;
        assert_eq!(channel.status(), ChannelStatus::Idle);
        assert_eq!(channel.framing(), Framing::Text);
    }

    #[tokio::test]
    async fn test_silent_microphone_produces_frames() {
        let mut frames = SilentMicrophone.open().unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.len(), crate::audio::PEER_FRAME_SAMPLES);
        assert!(frame.iter().all(|&b| b == 0xff));
    }

    #[tokio::test]
    async fn test_peer_state_maps_onto_status() {
        let (inbound, _rx) = inbound_channel();
        let shared = Shared::new(ChannelKind::PeerMedia, Framing::Text, inbound);
        let generation = shared.generation();

        assert!(shared.status.begin_connect());
        assert!(shared.status.connected());
        apply_peer_state(&shared, generation, RTCPeerConnectionState::Connected);
        assert_eq!(shared.status.get(), ChannelStatus::Connected);
        apply_peer_state(&shared, generation, RTCPeerConnectionState::Failed);
        assert_eq!(shared.status.get(), ChannelStatus::Error);

        // A superseded connection no longer drives the status.
        shared.status.reset();
        shared.bump();
        assert!(shared.status.begin_connect());
        apply_peer_state(&shared, generation, RTCPeerConnectionState::Failed);
        assert_eq!(shared.status.get(), ChannelStatus::Connecting);
    }
}
