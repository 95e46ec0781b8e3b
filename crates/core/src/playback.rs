//! Gapless scheduling of inbound audio chunks on a single output timeline.
//!
//! Chunks are decoded concurrently and placed on the device clock as each
//! decode completes: `start = max(now + SAFETY_LEAD, next_start)`. Placement
//! happens under one lock, so chunks never overlap and the cursor never moves
//! backwards.

use crate::{
    audio::{convert_i16_to_f32, mulaw_decode, pcm16_from_le_bytes},
    error::PlaybackError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lead applied when the device is first opened, in seconds.
pub const INITIAL_LEAD: f64 = 0.05;
/// Minimum distance between "now" and a newly scheduled chunk, in seconds.
pub const SAFETY_LEAD: f64 = 0.02;

/// Decoded interleaved samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, data: Bytes) -> Result<DecodedAudio, PlaybackError>;
}

/// An open output device with its own clock.
pub trait AudioSink: Send {
    /// Current position of the device clock, in seconds.
    fn now(&self) -> f64;

    fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> Result<(), PlaybackError>;

    fn close(&mut self);
}

/// Opens output devices on demand.
pub trait AudioOutput: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSink>, PlaybackError>;
}

/// The scheduled-start timestamp for the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackCursor {
    next_start: f64,
}

impl PlaybackCursor {
    pub fn starting_at(next_start: f64) -> Self {
        Self { next_start }
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Reserves `duration` seconds on the timeline and returns the start time.
    pub fn place(&mut self, now: f64, duration: f64) -> f64 {
        let start_at = (now + SAFETY_LEAD).max(self.next_start);
        self.next_start = start_at + duration;
        start_at
    }
}

/// Where a chunk landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Default)]
struct State {
    sink: Option<Box<dyn AudioSink>>,
    cursor: PlaybackCursor,
    closed: bool,
}

struct Inner {
    output: Box<dyn AudioOutput>,
    decoder: Box<dyn AudioDecoder>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        if let Some(mut sink) = state.sink.take() {
            sink.close();
            info!("Audio output released");
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cheap to clone; clones share one device and one timeline.
#[derive(Clone)]
pub struct AudioPlaybackScheduler {
    inner: Arc<Inner>,
}

impl AudioPlaybackScheduler {
    pub fn new(output: impl AudioOutput + 'static, decoder: impl AudioDecoder + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                output: Box::new(output),
                decoder: Box::new(decoder),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Queues a chunk without waiting for it to decode. Failures are logged and
    /// only affect this chunk.
    pub fn enqueue(&self, data: Bytes) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            match scheduler.play(data).await {
                Ok(chunk) => debug!(start_at = chunk.start_at, duration = chunk.duration, "Chunk scheduled"),
                Err(PlaybackError::Released) => debug!("Chunk discarded after release"),
                Err(e) => warn!(error = %e, "Dropping audio chunk"),
            }
        })
    }

    /// Decodes and schedules a chunk, returning where it was placed.
    pub async fn play(&self, data: Bytes) -> Result<ScheduledChunk, PlaybackError> {
        self.ensure_open()?;
        let audio = self.inner.decoder.decode(data).await?;
        let duration = audio.duration();

        let mut state = self.inner.lock();
        if state.closed {
            return Err(PlaybackError::Released);
        }
        let State { sink, cursor, .. } = &mut *state;
        let Some(sink) = sink.as_mut() else {
            return Err(PlaybackError::Released);
        };
        let start_at = cursor.place(sink.now(), duration);
        sink.schedule(audio, start_at)?;
        Ok(ScheduledChunk { start_at, duration })
    }

    fn ensure_open(&self) -> Result<(), PlaybackError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(PlaybackError::Released);
        }
        if state.sink.is_none() {
            let sink = self.inner.output.open()?;
            state.cursor = PlaybackCursor::starting_at(sink.now() + INITIAL_LEAD);
            state.sink = Some(sink);
            info!("Audio output opened");
        }
        Ok(())
    }

    /// Start time reserved for the next chunk.
    pub fn next_start(&self) -> f64 {
        self.inner.lock().cursor.next_start()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Releases the output device. Returns `true` only for the call that released it.
    pub fn close(&self) -> bool {
        self.inner.release()
    }
}

/// Raw little-endian PCM16, or a RIFF/WAVE container holding PCM16.
/// Compressed containers are rejected rather than read as samples.
#[derive(Debug, Clone, Copy)]
pub struct Pcm16Decoder {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn decode_bytes(&self, data: &[u8]) -> Result<DecodedAudio, PlaybackError> {
        if let Some(format) = compressed_format(data) {
            return Err(PlaybackError::Decode(format!("unsupported {format} chunk")));
        }
        let (payload, sample_rate, channels) = match parse_wav(data)? {
            Some(wav) => (wav.data, wav.sample_rate, wav.channels),
            None => (data, self.sample_rate, self.channels),
        };
        let samples = convert_i16_to_f32(&pcm16_from_le_bytes(payload));
        if samples.is_empty() {
            return Err(PlaybackError::Decode("no samples in chunk".into()));
        }
        Ok(DecodedAudio {
            samples,
            sample_rate,
            channels,
        })
    }
}

/// Recognizes compressed containers that must not be read as raw PCM.
fn compressed_format(data: &[u8]) -> Option<&'static str> {
    match data {
        [b'I', b'D', b'3', ..] => Some("mp3"),
        [0xff, sync, ..] if sync & 0xe0 == 0xe0 => Some("mpeg"),
        [b'O', b'g', b'g', b'S', ..] => Some("ogg"),
        [b'f', b'L', b'a', b'C', ..] => Some("flac"),
        [0x1a, 0x45, 0xdf, 0xa3, ..] => Some("webm"),
        _ => None,
    }
}

#[async_trait]
impl AudioDecoder for Pcm16Decoder {
    async fn decode(&self, data: Bytes) -> Result<DecodedAudio, PlaybackError> {
        self.decode_bytes(&data)
    }
}

/// G.711 mu-law mono, as carried by the peer media track.
#[derive(Debug, Clone, Copy)]
pub struct MulawDecoder {
    pub sample_rate: u32,
}

#[async_trait]
impl AudioDecoder for MulawDecoder {
    async fn decode(&self, data: Bytes) -> Result<DecodedAudio, PlaybackError> {
        if data.is_empty() {
            return Err(PlaybackError::Decode("no samples in chunk".into()));
        }
        let samples = data
            .iter()
            .map(|&b| mulaw_decode(b) as f32 / 32768.0)
            .collect();
        Ok(DecodedAudio {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
        })
    }
}

struct WavPayload<'a> {
    data: &'a [u8],
    sample_rate: u32,
    channels: u16,
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Returns `Ok(None)` when the bytes are not a RIFF/WAVE container at all.
fn parse_wav(bytes: &[u8]) -> Result<Option<WavPayload<'_>>, PlaybackError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Ok(None);
    }

    let mut format: Option<(u32, u16)> = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = read_u32(bytes, offset + 4).unwrap_or(0) as usize;
        let body_start = offset + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                let (Some(audio_format), Some(channels), Some(rate), Some(bits)) = (
                    read_u16(body, 0),
                    read_u16(body, 2),
                    read_u32(body, 4),
                    read_u16(body, 14),
                ) else {
                    return Err(PlaybackError::Decode("truncated fmt chunk".into()));
                };
                if audio_format != 1 || bits != 16 {
                    return Err(PlaybackError::Decode(format!(
                        "unsupported wav encoding (format {audio_format}, {bits} bits)"
                    )));
                }
                format = Some((rate, channels.max(1)));
            }
            b"data" => {
                let (sample_rate, channels) =
                    format.ok_or_else(|| PlaybackError::Decode("data before fmt chunk".into()))?;
                return Ok(Some(WavPayload {
                    data: body,
                    sample_rate,
                    channels,
                }));
            }
            _ => {}
        }
        // Chunks are padded to an even length.
        offset = body_start.saturating_add(size + (size & 1));
    }
    Err(PlaybackError::Decode("wav has no data chunk".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct DeviceLog {
        now: f64,
        scheduled: Vec<(f64, f64, usize)>,
        opens: usize,
        closes: usize,
        fail_next_open: bool,
    }

    #[derive(Clone, Default)]
    struct FakeOutput(Arc<Mutex<DeviceLog>>);

    struct FakeSink(Arc<Mutex<DeviceLog>>);

    impl AudioOutput for FakeOutput {
        fn open(&self) -> Result<Box<dyn AudioSink>, PlaybackError> {
            let mut log = self.0.lock().unwrap();
            if log.fail_next_open {
                log.fail_next_open = false;
                return Err(PlaybackError::Device("no device".into()));
            }
            log.opens += 1;
            Ok(Box::new(FakeSink(self.0.clone())))
        }
    }

    impl AudioSink for FakeSink {
        fn now(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> Result<(), PlaybackError> {
            self.0
                .lock()
                .unwrap()
                .scheduled
                .push((start_at, audio.duration(), audio.samples.len()));
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    /// Each chunk is `[delay_ms, samples / 100]`; decodes to that many samples at 1 kHz.
    struct SlowDecoder;

    #[async_trait]
    impl AudioDecoder for SlowDecoder {
        async fn decode(&self, data: Bytes) -> Result<DecodedAudio, PlaybackError> {
            let (Some(&delay), Some(&len)) = (data.first(), data.get(1)) else {
                return Err(PlaybackError::Decode("short chunk".into()));
            };
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            Ok(DecodedAudio {
                samples: vec![0.0; len as usize * 100],
                sample_rate: 1000,
                channels: 1,
            })
        }
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut cursor = PlaybackCursor::starting_at(0.05);
        assert_abs_diff_eq!(cursor.place(0.0, 0.1), 0.05);
        assert_abs_diff_eq!(cursor.next_start(), 0.15);
        // Device clock ran past the cursor: restart at now + lead.
        assert_abs_diff_eq!(cursor.place(1.0, 0.1), 1.02);
        assert_abs_diff_eq!(cursor.next_start(), 1.12);
        // Clock behind cursor: append.
        let before = cursor.next_start();
        assert_abs_diff_eq!(cursor.place(0.5, 0.2), before);
        assert!(cursor.next_start() >= before);
    }

    #[tokio::test]
    async fn test_chunks_are_back_to_back() {
        let output = FakeOutput::default();
        output.0.lock().unwrap().now = 10.0;
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);

        let first = scheduler.play(Bytes::from_static(&[0, 2])).await.unwrap();
        let second = scheduler.play(Bytes::from_static(&[0, 1])).await.unwrap();

        assert_abs_diff_eq!(first.start_at, 10.05);
        assert_abs_diff_eq!(first.duration, 0.2);
        assert_abs_diff_eq!(second.start_at, first.start_at + first.duration);
        assert_abs_diff_eq!(scheduler.next_start(), second.start_at + second.duration);
        assert_eq!(output.0.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_completion_order_decides_timeline() {
        let output = FakeOutput::default();
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);

        // Slow decode submitted first, fast one second.
        let slow = scheduler.enqueue(Bytes::from_static(&[120, 3]));
        let fast = scheduler.enqueue(Bytes::from_static(&[0, 1]));
        slow.await.unwrap();
        fast.await.unwrap();

        let log = output.0.lock().unwrap();
        let lens: Vec<usize> = log.scheduled.iter().map(|s| s.2).collect();
        assert_eq!(lens, vec![100, 300]);
        for pair in log.scheduled.windows(2) {
            let (start, duration, _) = pair[0];
            assert!(pair[1].0 >= start + duration - 1e-9, "chunks overlap");
        }
    }

    #[tokio::test]
    async fn test_decode_failure_drops_only_that_chunk() {
        let output = FakeOutput::default();
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);

        scheduler.play(Bytes::from_static(&[0, 1])).await.unwrap();
        let cursor = scheduler.next_start();
        assert!(matches!(
            scheduler.play(Bytes::from_static(&[7])).await,
            Err(PlaybackError::Decode(_))
        ));
        assert_abs_diff_eq!(scheduler.next_start(), cursor);

        let next = scheduler.play(Bytes::from_static(&[0, 1])).await.unwrap();
        assert_abs_diff_eq!(next.start_at, cursor);
    }

    #[tokio::test]
    async fn test_device_open_failure_retries_on_next_chunk() {
        let output = FakeOutput::default();
        output.0.lock().unwrap().fail_next_open = true;
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);

        assert!(matches!(
            scheduler.play(Bytes::from_static(&[0, 1])).await,
            Err(PlaybackError::Device(_))
        ));
        assert!(scheduler.play(Bytes::from_static(&[0, 1])).await.is_ok());
        assert_eq!(output.0.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_close_releases_once_and_discards_late_decodes() {
        let output = FakeOutput::default();
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);
        scheduler.play(Bytes::from_static(&[0, 1])).await.unwrap();

        let late = scheduler.clone();
        let pending = tokio::spawn(async move { late.play(Bytes::from_static(&[80, 1])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(scheduler.close());
        assert!(!scheduler.close());
        assert_eq!(pending.await.unwrap(), Err(PlaybackError::Released));
        assert!(matches!(
            scheduler.play(Bytes::from_static(&[0, 1])).await,
            Err(PlaybackError::Released)
        ));

        drop(scheduler);
        let log = output.0.lock().unwrap();
        assert_eq!(log.closes, 1);
        assert_eq!(log.scheduled.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let output = FakeOutput::default();
        let scheduler = AudioPlaybackScheduler::new(output.clone(), SlowDecoder);
        scheduler.play(Bytes::from_static(&[0, 1])).await.unwrap();
        drop(scheduler);
        assert_eq!(output.0.lock().unwrap().closes, 1);
    }

    fn wav(sample_rate: u32, channels: u16, bits: u16, samples: &[i16]) -> Vec<u8> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn test_pcm16_raw_bytes() {
        let decoder = Pcm16Decoder::new(16000, 1);
        let audio = decoder.decode_bytes(&[0x00, 0x40, 0x00, 0xc0, 0x7f]).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.samples.len(), 2);
        assert_abs_diff_eq!(audio.samples[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(audio.samples[1], -0.5, epsilon = 0.0001);

        assert!(matches!(decoder.decode_bytes(&[0x01]), Err(PlaybackError::Decode(_))));
    }

    #[test]
    fn test_pcm16_rejects_compressed_chunks() {
        let decoder = Pcm16Decoder::new(16000, 1);
        let chunks: [&[u8]; 6] = [
            b"ID3\x04\x00\x00\x00\x00\x00\x00\xff\xfb\x90\x64",
            &[0xff, 0xfb, 0x90, 0x64, 0x00, 0x00],
            &[0xff, 0xf1, 0x50, 0x80, 0x00, 0x1f],
            b"OggS\x00\x02\x00\x00",
            b"fLaC\x00\x00\x00\x22",
            &[0x1a, 0x45, 0xdf, 0xa3, 0x01, 0x00],
        ];
        for chunk in chunks {
            assert!(
                matches!(decoder.decode_bytes(chunk), Err(PlaybackError::Decode(_))),
                "accepted {:02x?}",
                &chunk[..4]
            );
        }
    }

    #[test]
    fn test_pcm16_wav_container() {
        let decoder = Pcm16Decoder::new(16000, 1);
        let audio = decoder.decode_bytes(&wav(22050, 2, 16, &[100, -100, 200, -200])).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.frames(), 2);

        assert!(matches!(
            decoder.decode_bytes(&wav(22050, 1, 8, &[1, 2])),
            Err(PlaybackError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_mulaw_decoder() {
        let decoder = MulawDecoder { sample_rate: 8000 };
        let audio = decoder.decode(Bytes::from_static(&[0xff; 160])).await.unwrap();
        assert_eq!(audio.channels, 1);
        assert_abs_diff_eq!(audio.duration(), 0.02);
        assert!(audio.samples.iter().all(|&s| s == 0.0));
        assert!(decoder.decode(Bytes::new()).await.is_err());
    }
}
