//! Speaker playback through rodio.
//!
//! The `OutputStream` is not `Send`, so it lives on a dedicated thread for
//! the life of the speaker; the `Sink` is shared and safe to drive from any
//! task. Raw PCM16 buffers (streamed response deltas) and encoded bytes
//! (one-shot TTS replies) both go through the same sink.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, Sink, Source};

use super::AudioError;

/// Boundary trait for the kiosk speaker.
pub trait SpeakerSink: Send + Sync {
    /// Queue a raw mono PCM16 buffer for playback.
    fn play_pcm(&self, sample_rate: u32, samples: Vec<i16>) -> Result<(), AudioError>;

    /// Decode and queue an encoded audio clip (WAV/MP3).
    fn play_encoded(&self, bytes: Vec<u8>) -> Result<(), AudioError>;

    /// Stop playback immediately and drop anything queued.
    fn stop(&self);

    /// Whether audio is currently queued or playing.
    fn is_busy(&self) -> bool;
}

/// Speaker backed by the default rodio output device.
pub struct RodioSpeaker {
    sink: Arc<Sink>,
    stop_tx: std_mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl RodioSpeaker {
    /// Open the default output device.
    pub fn new() -> Result<Self, AudioError> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<Sink>, AudioError>>();

        let join = std::thread::Builder::new()
            .name("speaker".into())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::PlaybackUnavailable(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::PlaybackUnavailable(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sink));

                // Keep the output stream alive until the speaker is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Speaker thread exiting");
            })
            .map_err(|e| AudioError::PlaybackUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(sink)) => {
                log::info!("Speaker sink ready");
                Ok(Self {
                    sink,
                    stop_tx,
                    join: Some(join),
                })
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(AudioError::PlaybackUnavailable(
                "Speaker thread ended before reporting readiness".to_string(),
            )),
        }
    }
}

impl SpeakerSink for RodioSpeaker {
    fn play_pcm(&self, sample_rate: u32, samples: Vec<i16>) -> Result<(), AudioError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.sink.append(SamplesBuffer::new(1, sample_rate, samples));
        Ok(())
    }

    fn play_encoded(&self, bytes: Vec<u8>) -> Result<(), AudioError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = Decoder::new(Cursor::new(bytes))
            .map_err(|e| AudioError::PlaybackUnavailable(format!("Decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_busy(&self) -> bool {
        !self.sink.empty()
    }
}

impl Drop for RodioSpeaker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
