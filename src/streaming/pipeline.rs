//! Audio pipeline bridging the devices and the wire protocol.
//!
//! Outbound: captured mono PCM16 accumulates in a buffer; on commit it is
//! split into fixed-size chunks, base64-wrapped as append events, and paced
//! so the service is never fed much faster than real time. Inbound: each
//! audio delta is decoded and handed to the speaker sink as it arrives, with
//! a stall watchdog so a stuck sink can never hang the UI.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::connection::StreamConnection;
use super::protocol::{decode_audio, ClientEvent, STREAM_SAMPLE_RATE};
use super::StreamingError;
use crate::audio::{downsample, AudioError, CaptureHandle, MicrophoneSource, SpeakerSink};

/// Outbound chunk size in bytes of PCM16 (about a third of a second at 24kHz).
const CHUNK_BYTES: usize = 16_000;

/// Pacing delay between outbound chunk sends.
const CHUNK_PACING: Duration = Duration::from_millis(250);

/// Utterances smaller than this are treated as an empty press and cleared
/// instead of committed (100ms at 24kHz).
const MIN_UTTERANCE_BYTES: usize = 4_800;

/// Inbound deltas smaller than this are noise and never reach the speaker.
const MIN_PLAYBACK_BYTES: usize = 256;

/// Force-stop playback when no delta has arrived for this long while the
/// sink still claims to be busy.
const PLAYBACK_STALL_CEILING: Duration = Duration::from_secs(10);

/// Result of flushing the captured utterance to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Chunks were appended and the buffer committed.
    Committed { chunks: usize },
    /// Below the minimum utterance size; nothing was sent.
    Empty,
}

pub struct AudioPipeline {
    mic: Arc<dyn MicrophoneSource>,
    speaker: Arc<dyn SpeakerSink>,
    conn: StreamConnection,
    captured: Arc<Mutex<Vec<i16>>>,
    capture: Mutex<Option<CaptureHandle>>,
    /// Latched when a device fails; the audio path stays off afterwards.
    disabled: AtomicBool,
    last_delta_at: Mutex<Option<Instant>>,
}

impl AudioPipeline {
    pub fn new(
        mic: Arc<dyn MicrophoneSource>,
        speaker: Arc<dyn SpeakerSink>,
        conn: StreamConnection,
    ) -> Self {
        Self {
            mic,
            speaker,
            conn,
            captured: Arc::new(Mutex::new(Vec::new())),
            capture: Mutex::new(None),
            disabled: AtomicBool::new(false),
            last_delta_at: Mutex::new(None),
        }
    }

    /// Whether the audio path has been disabled by a device failure.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Whether synthesized speech is currently queued or playing.
    pub fn is_speaking(&self) -> bool {
        self.speaker.is_busy()
    }

    /// Begin capturing a fresh utterance. Any previous capture is replaced.
    pub async fn start_capture(&self) -> Result<(), AudioError> {
        if self.is_disabled() {
            return Err(AudioError::Disabled);
        }

        self.stop_capture().await;
        self.captured.lock().unwrap().clear();

        let (tx, mut rx) = mpsc::channel::<Vec<i16>>(100);
        let mic = self.mic.clone();

        let handle = tokio::task::spawn_blocking(move || mic.open(tx))
            .await
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .map_err(|e| {
                self.disabled.store(true, Ordering::SeqCst);
                e
            })?;

        *self.capture.lock().unwrap() = Some(handle);

        let captured = self.captured.clone();
        let source_rate = self.mic.sample_rate();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let resampled = downsample(&batch, source_rate, STREAM_SAMPLE_RATE);
                captured.lock().unwrap().extend(resampled);
            }
            log::debug!("Capture drain task exiting");
        });

        Ok(())
    }

    /// Stop capturing. Safe to call when no capture is active.
    pub async fn stop_capture(&self) {
        let handle = self.capture.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        }
    }

    /// Synchronous best-effort capture teardown for cleanup paths: signals
    /// the capture thread without joining it.
    pub fn abort_capture(&self) {
        let _ = self.capture.lock().unwrap().take();
    }

    /// Push samples into the capture buffer directly (drain task and tests).
    pub fn ingest_samples(&self, samples: &[i16], source_rate: u32) {
        let resampled = downsample(samples, source_rate, STREAM_SAMPLE_RATE);
        self.captured.lock().unwrap().extend(resampled);
    }

    /// Bytes currently buffered for the in-progress utterance.
    pub fn captured_bytes(&self) -> usize {
        self.captured.lock().unwrap().len() * mem::size_of::<i16>()
    }

    /// Send the buffered utterance as paced append chunks followed by a
    /// commit. Returns [`FlushOutcome::Empty`] without sending anything when
    /// the capture is below the noise floor.
    pub async fn flush_and_commit(&self) -> Result<FlushOutcome, StreamingError> {
        let samples = mem::take(&mut *self.captured.lock().unwrap());
        let bytes = pcm16_to_bytes(&samples);

        if bytes.len() < MIN_UTTERANCE_BYTES {
            log::info!(
                "Utterance below noise floor ({} bytes), not committing",
                bytes.len()
            );
            return Ok(FlushOutcome::Empty);
        }

        let mut chunks = 0usize;
        for chunk in bytes.chunks(CHUNK_BYTES) {
            if chunks > 0 {
                tokio::time::sleep(CHUNK_PACING).await;
            }
            self.conn.enqueue(ClientEvent::audio_append(chunk))?;
            chunks += 1;
        }

        self.conn.enqueue(ClientEvent::AudioCommit)?;
        log::info!("Utterance committed ({} chunks, {} bytes)", chunks, bytes.len());

        Ok(FlushOutcome::Committed { chunks })
    }

    /// Decode an inbound audio delta and queue it for playback.
    pub fn play_delta(&self, delta: &str) -> Result<(), StreamingError> {
        if self.is_disabled() {
            return Ok(());
        }

        let bytes =
            decode_audio(delta).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

        if bytes.len() < MIN_PLAYBACK_BYTES {
            log::debug!("Dropping sub-threshold audio delta ({} bytes)", bytes.len());
            return Ok(());
        }

        let samples = bytes_to_pcm16(&bytes);
        if let Err(e) = self.speaker.play_pcm(STREAM_SAMPLE_RATE, samples) {
            log::error!("Playback failed, disabling audio path: {}", e);
            self.disabled.store(true, Ordering::SeqCst);
            return Ok(());
        }

        *self.last_delta_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Stop playback immediately and drop anything queued.
    pub fn stop_playback(&self) {
        self.speaker.stop();
        *self.last_delta_at.lock().unwrap() = None;
    }

    /// Per-frame stall check: a sink still busy long after the last delta is
    /// force-stopped so it cannot hang the UI indefinitely.
    pub fn watchdog_tick(&self) {
        if !self.speaker.is_busy() {
            return;
        }
        let stalled = self
            .last_delta_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed() > PLAYBACK_STALL_CEILING)
            .unwrap_or(false);
        if stalled {
            log::warn!(
                "Playback stalled for more than {:?}, force-stopping",
                PLAYBACK_STALL_CEILING
            );
            self.stop_playback();
        }
    }
}

fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
