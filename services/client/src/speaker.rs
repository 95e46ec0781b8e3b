//! Default output device as a playback sink.
//!
//! The device callback drains a mono sample queue whose head is the current
//! device position. Scheduling a chunk pads the queue with silence up to the
//! chunk's start frame, so the device clock and the scheduler agree on time.

use cpal::{
    FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use parley_core::{
    audio::{downmix, resample_mono},
    error::PlaybackError,
    playback::{AudioOutput, AudioSink, DecodedAudio},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError, mpsc as std_mpsc},
    thread,
};
use tracing::{debug, error, info, warn};

/// Frames played so far and the samples queued after them.
#[derive(Debug)]
pub struct Timeline {
    sample_rate: u32,
    played: u64,
    queue: VecDeque<f32>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            played: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn now(&self) -> f64 {
        self.played as f64 / self.sample_rate as f64
    }

    /// Queues mono samples at the device rate to start at `start_at` seconds.
    /// A start in the past plays as soon as the queue allows.
    pub fn schedule(&mut self, samples: &[f32], start_at: f64) {
        let start_frame = (start_at * self.sample_rate as f64).round().max(0.0) as u64;
        let queue_end = self.played + self.queue.len() as u64;
        if start_frame > queue_end {
            let gap = (start_frame - queue_end) as usize;
            self.queue.extend(std::iter::repeat_n(0.0, gap));
        }
        self.queue.extend(samples.iter().copied());
    }

    /// Produces the next `frames` mono samples, silence when nothing is queued.
    pub fn pull(&mut self, frames: usize, mut write: impl FnMut(f32)) {
        for _ in 0..frames {
            write(self.queue.pop_front().unwrap_or(0.0));
        }
        self.played += frames as u64;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

type SharedTimeline = Arc<Mutex<Timeline>>;

fn lock(timeline: &SharedTimeline) -> std::sync::MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens the default output device on a dedicated thread, since cpal streams
/// cannot move between threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeakerOutput;

impl AudioOutput for SpeakerOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>, PlaybackError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(SharedTimeline, u32), PlaybackError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-speaker".into())
            .spawn(move || match build_stream() {
                Ok((stream, timeline, rate)) => {
                    let _ = ready_tx.send(Ok((timeline, rate)));
                    // Keep the stream alive until the sink is closed or dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Speaker stream stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        let (timeline, sample_rate) = ready_rx
            .recv()
            .map_err(|_| PlaybackError::Device("speaker thread exited".into()))??;
        info!(sample_rate, "Speaker opened");
        Ok(Box::new(SpeakerSink {
            timeline,
            sample_rate,
            stop: Some(stop_tx),
        }))
    }
}

fn build_stream() -> Result<(Stream, SharedTimeline, u32), PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::Device("no output device".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let timeline = Arc::new(Mutex::new(Timeline::new(sample_rate)));

    let stream = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, timeline.clone()),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, timeline.clone()),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, timeline.clone()),
        other => Err(PlaybackError::Device(format!("unsupported sample format {other:?}"))),
    }?;
    stream
        .play()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    Ok((stream, timeline, sample_rate))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: SharedTimeline,
) -> Result<Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let mut frame = data.chunks_mut(channels);
                lock(&timeline).pull(frames, |sample| {
                    if let Some(out) = frame.next() {
                        out.fill(T::from_sample(sample));
                    }
                });
            },
            |err| error!("Speaker stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::Device(e.to_string()))
}

struct SpeakerSink {
    timeline: SharedTimeline,
    sample_rate: u32,
    stop: Option<std_mpsc::Sender<()>>,
}

impl AudioSink for SpeakerSink {
    fn now(&self) -> f64 {
        lock(&self.timeline).now()
    }

    fn schedule(&mut self, audio: DecodedAudio, start_at: f64) -> Result<(), PlaybackError> {
        let mono = downmix(&audio.samples, audio.channels);
        let samples = resample_mono(&mono, audio.sample_rate, self.sample_rate)
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        lock(&self.timeline).schedule(&samples, start_at);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.timeline).clear();
        if let Some(stop) = self.stop.take() {
            if stop.send(()).is_err() {
                warn!("Speaker thread already gone");
            }
        }
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn drain(timeline: &mut Timeline, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        timeline.pull(frames, |s| out.push(s));
        out
    }

    #[test]
    fn test_silence_is_padded_up_to_start() {
        let mut timeline = Timeline::new(10);
        timeline.schedule(&[1.0, 1.0], 0.3);
        assert_eq!(drain(&mut timeline, 6), vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0]);
        assert_abs_diff_eq!(timeline.now(), 0.6);
    }

    #[test]
    fn test_back_to_back_chunks_do_not_gap() {
        let mut timeline = Timeline::new(10);
        timeline.schedule(&[0.1, 0.2], 0.0);
        timeline.schedule(&[0.3], 0.2);
        assert_eq!(drain(&mut timeline, 3), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_late_chunk_plays_immediately() {
        let mut timeline = Timeline::new(10);
        drain(&mut timeline, 5);
        timeline.schedule(&[0.5], 0.1);
        assert_eq!(drain(&mut timeline, 2), vec![0.5, 0.0]);
    }

    #[test]
    fn test_clear_drops_pending_audio() {
        let mut timeline = Timeline::new(10);
        timeline.schedule(&[0.5; 4], 0.0);
        timeline.clear();
        assert_eq!(drain(&mut timeline, 2), vec![0.0, 0.0]);
    }
}
