//! Default input device as the peer channel's microphone.

use bytes::Bytes;
use cpal::{
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use parley_core::{
    audio::{PEER_AUDIO_SAMPLE_RATE, PEER_FRAME_SAMPLES, convert_f32_to_i16, create_resampler, downmix, mulaw_encode},
    channel::peer::Microphone,
    error::ConnectionError,
};
use rubato::{FastFixedIn, Resampler};
use std::{sync::mpsc as std_mpsc, thread, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const FRAME_QUEUE: usize = 16;
const STOP_POLL: Duration = Duration::from_millis(100);

/// Turns device-rate mono samples into 20 ms mu-law frames at 8 kHz.
pub struct MulawFramer {
    block: usize,
    input: Vec<f32>,
    resampler: Option<FastFixedIn<f32>>,
    output: Vec<f32>,
}

impl MulawFramer {
    pub fn new(device_rate: u32) -> anyhow::Result<Self> {
        // One resampler block is one frame's worth of device samples.
        let block = (device_rate as usize / 50).max(1);
        let resampler = if device_rate == PEER_AUDIO_SAMPLE_RATE {
            None
        } else {
            Some(create_resampler(
                device_rate as f64,
                PEER_AUDIO_SAMPLE_RATE as f64,
                block,
            )?)
        };
        Ok(Self {
            block,
            input: Vec::with_capacity(block),
            resampler,
            output: Vec::with_capacity(PEER_FRAME_SAMPLES * 2),
        })
    }

    /// Feeds samples and returns every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> anyhow::Result<Vec<Bytes>> {
        match self.resampler.as_mut() {
            None => self.output.extend_from_slice(samples),
            Some(resampler) => {
                self.input.extend_from_slice(samples);
                while self.input.len() >= self.block {
                    let block: Vec<f32> = self.input.drain(..self.block).collect();
                    let resampled = resampler.process(&[block], None)?;
                    self.output.extend_from_slice(&resampled[0]);
                }
            }
        }

        let mut frames = Vec::new();
        while self.output.len() >= PEER_FRAME_SAMPLES {
            let chunk: Vec<f32> = self.output.drain(..PEER_FRAME_SAMPLES).collect();
            let encoded: Vec<u8> = convert_f32_to_i16(&chunk)
                .into_iter()
                .map(mulaw_encode)
                .collect();
            frames.push(Bytes::from(encoded));
        }
        Ok(frames)
    }
}

/// Captures from the default input device on a dedicated thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn open(&self) -> Result<mpsc::Receiver<Bytes>, ConnectionError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, ConnectionError>>();

        thread::Builder::new()
            .name("parley-microphone".into())
            .spawn(move || {
                let probe = frames_tx.clone();
                match build_stream(frames_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        // Capture runs until the consumer drops the receiver.
                        while !probe.is_closed() {
                            thread::sleep(STOP_POLL);
                        }
                        drop(stream);
                        debug!("Microphone stream stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| ConnectionError::Microphone(e.to_string()))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| ConnectionError::Microphone("capture thread exited".into()))??;
        info!(sample_rate = rate, "Microphone opened");
        Ok(frames_rx)
    }
}

fn build_stream(frames_tx: mpsc::Sender<Bytes>) -> Result<(Stream, u32), ConnectionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| ConnectionError::Microphone("no input device".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| ConnectionError::Microphone(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let framer =
        MulawFramer::new(sample_rate).map_err(|e| ConnectionError::Microphone(e.to_string()))?;

    let stream = match sample_format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, framer, frames_tx),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, framer, frames_tx),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, framer, frames_tx),
        other => Err(ConnectionError::Microphone(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| ConnectionError::Microphone(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut framer: MulawFramer,
    frames_tx: mpsc::Sender<Bytes>,
) -> Result<Stream, ConnectionError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1);
    let mut dropped: u64 = 0;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                let mono = downmix(&samples, channels);
                let frames = match framer.push(&mono) {
                    Ok(frames) => frames,
                    Err(e) => {
                        error!(error = %e, "Microphone resampling failed");
                        return;
                    }
                };
                for frame in frames {
                    // The audio callback must not block; a full queue drops the frame.
                    if frames_tx.try_send(frame).is_err() {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            warn!(dropped, "Microphone frames dropped");
                        }
                    }
                }
            },
            |err| error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(|e| ConnectionError::Microphone(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_rate_frames_silence() {
        let mut framer = MulawFramer::new(PEER_AUDIO_SAMPLE_RATE).unwrap();
        assert!(framer.push(&[0.0; 100]).unwrap().is_empty());

        let frames = framer.push(&[0.0; 220]).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == PEER_FRAME_SAMPLES));
        assert!(frames[0].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_device_rate_is_resampled_to_peer_rate() {
        let mut framer = MulawFramer::new(48_000).unwrap();
        let mut frames = Vec::new();
        // Ten 20 ms blocks at 48 kHz.
        for _ in 0..10 {
            frames.extend(framer.push(&[0.25; 960]).unwrap());
        }
        assert!(frames.len() >= 8 && frames.len() <= 10, "got {} frames", frames.len());
        assert!(frames.iter().all(|f| f.len() == PEER_FRAME_SAMPLES));
    }
}
