//! Microphone capture using CPAL.
//!
//! The capture stream lives on a dedicated thread (CPAL streams are not
//! `Send`); the audio callback converts incoming frames to mono PCM16 and
//! pushes batches into a tokio channel without ever blocking. Consumers
//! downsample to the negotiated stream rate as needed.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::AudioError;

/// Boundary trait for a microphone that yields raw PCM16 sample batches.
pub trait MicrophoneSource: Send + Sync {
    /// Native sample rate of the produced samples.
    fn sample_rate(&self) -> u32;

    /// Start capturing; batches are pushed into `tx` until the returned
    /// handle is stopped. Batches that would overflow the channel are
    /// dropped rather than blocking the audio thread.
    fn open(&self, tx: mpsc::Sender<Vec<i16>>) -> Result<CaptureHandle, AudioError>;
}

/// Handle to an active capture. Stopping tears down the stream thread.
pub struct CaptureHandle {
    stop_tx: std_mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn new(stop_tx: std_mpsc::Sender<()>, join: JoinHandle<()>) -> Self {
        Self {
            stop_tx,
            join: Some(join),
        }
    }

    /// Stop capturing and wait for the stream thread to wind down.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Microphone backed by the default CPAL input device.
pub struct CpalMicrophone {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl CpalMicrophone {
    /// Create a microphone from the default input device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn open(&self, tx: mpsc::Sender<Vec<i16>>) -> Result<CaptureHandle, AudioError> {
        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let channels = config.channels as usize;

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

        let join = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match build_stream(&device, &config, sample_format, channels, tx) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Hold the stream alive until stop is requested.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Capture started ({} Hz)", self.config.sample_rate.0);
                Ok(CaptureHandle::new(stop_tx, join))
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(AudioError::StreamCreationFailed(
                "Capture thread ended before reporting readiness".to_string(),
            )),
        }
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    channels: usize,
    tx: mpsc::Sender<Vec<i16>>,
) -> Result<cpal::Stream, AudioError> {
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, config, channels, tx, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(device, config, channels, tx, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(device, config, channels, tx, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    tx: mpsc::Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix_to_mono(data, channels);
                // Never block the audio callback; a full channel drops the batch.
                if tx.try_send(mono).is_err() {
                    log::debug!("Capture channel full, dropping batch");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Average interleaved frames down to mono PCM16.
fn downmix_to_mono<T: cpal::Sample<Float = f32>>(data: &[T], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.iter().map(|&s| sample_to_i16(s)).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| sample_to_i16(s) as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Convert any sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Downsample audio from source rate to target rate using simple averaging.
///
/// Supports integer ratios (e.g. 48kHz to 24kHz); other ratios return the
/// input unchanged with a warning.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}
