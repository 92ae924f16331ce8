//! Non-streaming fallback voice backend.
//!
//! No persistent connection: the whole utterance is recorded, transcribed in
//! one HTTP request, answered with a single chat completion, synthesized
//! once, and played once. Slower than streaming but with far fewer moving
//! parts, which is exactly why it is the failover target.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::VoiceBackend;
use crate::audio::{CaptureHandle, MicrophoneSource, SpeakerSink};
use crate::panel;
use crate::settings::{self, VoiceSettings};
use crate::status::{StatusHandle, StatusReport, VoiceState};
use crate::surface::{DrawSurface, PanelRect};

const PANEL_TITLE: &str = "Voice AI";
const READY_MESSAGE: &str = "Press the button to speak";

/// Utterances shorter than this are never sent out.
const MIN_UTTERANCE_MS: u64 = 500;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors on the fallback voice path.
#[derive(Debug)]
pub enum FallbackError {
    /// Service API key not configured
    MissingApiKey,
    /// Network/HTTP error
    NetworkError(String),
    /// The service returned an error
    ApiError { status: u16, message: String },
    /// Failed to parse a service response
    ParseError(String),
    /// Capture or playback device problem
    AudioUnavailable(String),
}

impl std::fmt::Display for FallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackError::MissingApiKey => {
                write!(
                    f,
                    "Service API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            FallbackError::NetworkError(e) => write!(f, "Network error: {}", e),
            FallbackError::ApiError { status, message } => {
                write!(f, "Service error ({}): {}", status, message)
            }
            FallbackError::ParseError(e) => write!(f, "Failed to parse service response: {}", e),
            FallbackError::AudioUnavailable(e) => write!(f, "Audio unavailable: {}", e),
        }
    }
}

impl std::error::Error for FallbackError {}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

enum CapturePhase {
    Idle,
    /// Microphone is being opened on a worker task.
    Starting,
    Recording {
        capture: CaptureHandle,
        buffer: Arc<Mutex<Vec<i16>>>,
        drain: tokio::task::JoinHandle<()>,
    },
    /// Transcribing / answering / speaking.
    Busy,
}

pub struct FallbackVoiceBackend {
    settings: VoiceSettings,
    api_key: String,
    mic: Arc<dyn MicrophoneSource>,
    speaker: Arc<dyn SpeakerSink>,
    status: StatusHandle,
    phase: Arc<Mutex<CapturePhase>>,
    last_reply: Arc<Mutex<String>>,
    handle: tokio::runtime::Handle,
    shutdown: CancellationToken,
    /// Latched when a device fails; reported through `healthy()`.
    impaired: Arc<AtomicBool>,
    cleaned: AtomicBool,
}

impl FallbackVoiceBackend {
    pub fn new(
        settings: &VoiceSettings,
        mic: Arc<dyn MicrophoneSource>,
        speaker: Arc<dyn SpeakerSink>,
        handle: tokio::runtime::Handle,
    ) -> Result<Arc<Self>, FallbackError> {
        let api_key = settings::api_key().ok_or(FallbackError::MissingApiKey)?;

        Ok(Arc::new(Self {
            settings: settings.clone(),
            api_key,
            mic,
            speaker,
            status: StatusHandle::new(VoiceState::Ready, READY_MESSAGE),
            phase: Arc::new(Mutex::new(CapturePhase::Idle)),
            last_reply: Arc::new(Mutex::new(String::new())),
            handle,
            shutdown: CancellationToken::new(),
            impaired: Arc::new(AtomicBool::new(false)),
            cleaned: AtomicBool::new(false),
        }))
    }

    fn start_recording(&self) {
        self.status.set(VoiceState::Listening, "Recording...");
        *self.last_reply.lock().unwrap() = String::new();

        let mic = self.mic.clone();
        let phase = self.phase.clone();
        let status = self.status.clone();
        let impaired = self.impaired.clone();

        self.handle.spawn(async move {
            let (tx, mut rx) = mpsc::channel::<Vec<i16>>(100);
            let buffer = Arc::new(Mutex::new(Vec::<i16>::new()));

            let capture = match tokio::task::spawn_blocking(move || mic.open(tx)).await {
                Ok(Ok(capture)) => capture,
                Ok(Err(e)) => {
                    log::error!("Microphone unavailable: {}", e);
                    impaired.store(true, Ordering::SeqCst);
                    status.set(VoiceState::Error, "Microphone unavailable");
                    *phase.lock().unwrap() = CapturePhase::Idle;
                    return;
                }
                Err(e) => {
                    log::error!("Capture task failed: {}", e);
                    status.set(VoiceState::Error, "Microphone unavailable");
                    *phase.lock().unwrap() = CapturePhase::Idle;
                    return;
                }
            };

            let drain_buffer = buffer.clone();
            let drain = tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    drain_buffer.lock().unwrap().extend(batch);
                }
            });

            let mut slot = phase.lock().unwrap();
            if matches!(*slot, CapturePhase::Starting) {
                *slot = CapturePhase::Recording {
                    capture,
                    buffer,
                    drain,
                };
            } else {
                // Cleanup raced the microphone open; tear the capture down.
                drop(capture);
                drain.abort();
            }
        });
    }

    fn finish_recording(&self, capture: CaptureHandle, buffer: Arc<Mutex<Vec<i16>>>, drain: tokio::task::JoinHandle<()>) {
        self.status
            .set(VoiceState::Processing, "Recognizing speech...");

        // Dropping the handle signals the capture thread without joining it
        // on the UI thread.
        drop(capture);

        let settings = self.settings.clone();
        let api_key = self.api_key.clone();
        let speaker = self.speaker.clone();
        let status = self.status.clone();
        let phase = self.phase.clone();
        let last_reply = self.last_reply.clone();
        let sample_rate = self.mic.sample_rate();
        let shutdown = self.shutdown.clone();
        let impaired = self.impaired.clone();

        self.handle.spawn(async move {
            // The drain task ends once the capture thread drops its sender.
            let _ = drain.await;
            let samples = std::mem::take(&mut *buffer.lock().unwrap());

            let outcome = run_exchange(
                &settings,
                &api_key,
                speaker,
                &status,
                &last_reply,
                samples,
                sample_rate,
                &shutdown,
            )
            .await;

            match outcome {
                Ok(()) => status.set(VoiceState::Ready, READY_MESSAGE),
                Err(FallbackError::AudioUnavailable(e)) => {
                    log::error!("Audio path failed: {}", e);
                    impaired.store(true, Ordering::SeqCst);
                    status.set(VoiceState::Error, "Speaker unavailable");
                }
                Err(e) => {
                    log::error!("Voice exchange failed: {}", e);
                    status.set(VoiceState::Error, "Voice request failed");
                }
            }

            *phase.lock().unwrap() = CapturePhase::Idle;
        });
    }
}

impl VoiceBackend for FallbackVoiceBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn on_button_press(&self) {
        let mut phase = self.phase.lock().unwrap();
        match std::mem::replace(&mut *phase, CapturePhase::Busy) {
            CapturePhase::Idle => {
                *phase = CapturePhase::Starting;
                drop(phase);
                self.start_recording();
            }
            CapturePhase::Recording {
                capture,
                buffer,
                drain,
            } => {
                drop(phase);
                self.finish_recording(capture, buffer, drain);
            }
            CapturePhase::Starting => {
                // Press while the microphone is still opening; keep waiting.
                *phase = CapturePhase::Starting;
                log::debug!("Button press ignored while capture is starting");
            }
            CapturePhase::Busy => {
                *phase = CapturePhase::Busy;
                log::debug!("Button press ignored while processing");
            }
        }
    }

    fn update(&self) {}

    fn draw(&self, surface: &mut dyn DrawSurface, rect: PanelRect) {
        let reply = self.last_reply.lock().unwrap().clone();
        let caption = if reply.is_empty() { None } else { Some(reply) };
        panel::draw_panel(
            surface,
            rect,
            PANEL_TITLE,
            &self.status.report(),
            caption.as_deref(),
        );
    }

    fn status(&self) -> StatusReport {
        self.status.report()
    }

    fn healthy(&self) -> bool {
        !self.impaired.load(Ordering::SeqCst) && !self.cleaned.load(Ordering::SeqCst)
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Fallback backend cleanup");
        self.shutdown.cancel();
        *self.phase.lock().unwrap() = CapturePhase::Idle;
        self.speaker.stop();
    }
}

/// Whether a capture is too short to bother transcribing.
fn too_short(samples: usize, sample_rate: u32) -> bool {
    if sample_rate == 0 {
        return true;
    }
    let ms = samples as u64 * 1000 / sample_rate as u64;
    ms < MIN_UTTERANCE_MS
}

/// Record-to-reply exchange: transcribe, answer, synthesize, play.
#[allow(clippy::too_many_arguments)]
async fn run_exchange(
    settings: &VoiceSettings,
    api_key: &str,
    speaker: Arc<dyn SpeakerSink>,
    status: &StatusHandle,
    last_reply: &Arc<Mutex<String>>,
    samples: Vec<i16>,
    sample_rate: u32,
    shutdown: &CancellationToken,
) -> Result<(), FallbackError> {
    if too_short(samples.len(), sample_rate) {
        log::info!("Utterance too short ({} samples), skipping", samples.len());
        status.set(VoiceState::Ready, "Didn't catch that");
        return Ok(());
    }

    let wav = encode_wav(&samples, sample_rate)?;
    let prompt = transcribe(settings, api_key, wav).await?;
    let prompt = prompt.trim().to_string();

    if prompt.is_empty() {
        status.set(VoiceState::Ready, "Speech not understood");
        return Ok(());
    }

    log::info!("Speech recognized: {}", prompt);
    status.set(VoiceState::Processing, "Generating response...");

    let reply = ask_chat(settings, api_key, &prompt).await?;
    log::info!("Reply: {}", reply);
    *last_reply.lock().unwrap() = reply.clone();

    status.set(VoiceState::Speaking, "Playing response...");
    let audio = synthesize(settings, api_key, &reply).await?;
    speaker
        .play_encoded(audio)
        .map_err(|e| FallbackError::AudioUnavailable(e.to_string()))?;

    // Hold the speaking state until playback drains.
    while speaker.is_busy() {
        tokio::select! {
            _ = shutdown.cancelled() => {
                speaker.stop();
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    Ok(())
}

/// Wrap mono PCM16 in an in-memory WAV container.
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, FallbackError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| FallbackError::AudioUnavailable(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| FallbackError::AudioUnavailable(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| FallbackError::AudioUnavailable(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

async fn transcribe(
    settings: &VoiceSettings,
    api_key: &str,
    wav: Vec<u8>,
) -> Result<String, FallbackError> {
    log::info!("Transcribing utterance ({} bytes)", wav.len());

    let file_part = Part::bytes(wav)
        .file_name("utterance.wav")
        .mime_str("audio/wav")
        .map_err(|e| FallbackError::ParseError(e.to_string()))?;

    let form = Form::new()
        .part("file", file_part)
        .text("model", settings.transcription_model.clone())
        .text("response_format", "json")
        .text("temperature", "0");

    let response = get_http_client()
        .post(format!("{}/audio/transcriptions", settings.api_base))
        .header("Authorization", format!("Bearer {}", api_key))
        .multipart(form)
        .send()
        .await
        .map_err(|e| FallbackError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let parsed: TranscriptionResponse = response
        .json()
        .await
        .map_err(|e| FallbackError::ParseError(e.to_string()))?;
    Ok(parsed.text)
}

/// Request body for the chat completion.
fn chat_request_body(settings: &VoiceSettings, prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "model": settings.chat_model,
        "messages": [
            { "role": "system", "content": settings.instructions },
            { "role": "user", "content": prompt }
        ],
        "max_tokens": settings.max_response_tokens,
        "n": 1,
        "temperature": 0.7,
    })
}

async fn ask_chat(
    settings: &VoiceSettings,
    api_key: &str,
    prompt: &str,
) -> Result<String, FallbackError> {
    let response = get_http_client()
        .post(format!("{}/chat/completions", settings.api_base))
        .header("Authorization", format!("Bearer {}", api_key))
        .json(&chat_request_body(settings, prompt))
        .send()
        .await
        .map_err(|e| FallbackError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .map_err(|e| FallbackError::ParseError(e.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.trim().to_string())
        .ok_or_else(|| FallbackError::ParseError("Empty choices in chat response".to_string()))
}

async fn synthesize(
    settings: &VoiceSettings,
    api_key: &str,
    text: &str,
) -> Result<Vec<u8>, FallbackError> {
    let body = serde_json::json!({
        "model": settings.tts_model,
        "input": text,
        "voice": settings.voice,
    });

    let response = get_http_client()
        .post(format!("{}/audio/speech", settings.api_base))
        .header("Authorization", format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await
        .map_err(|e| FallbackError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FallbackError::NetworkError(e.to_string()))?;
    Ok(bytes.to_vec())
}

async fn api_error(response: reqwest::Response) -> FallbackError {
    let status = response.status().as_u16();
    let error_text = response.text().await.unwrap_or_default();

    let message = if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
        parsed.error.message
    } else {
        error_text
    };

    log::error!("Service error ({}): {}", status, message);
    FallbackError::ApiError { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_error_display() {
        let err = FallbackError::MissingApiKey;
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn api_error_display() {
        let err = FallbackError::ApiError {
            status: 401,
            message: "Invalid API key".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[test]
    fn encode_wav_produces_riff_container() {
        let samples = vec![0i16; 4800];
        let wav = encode_wav(&samples, 48000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // Header plus two bytes per sample.
        assert_eq!(wav.len(), 44 + samples.len() * 2);
    }

    #[test]
    fn short_utterances_are_gated() {
        // 100ms at 48kHz
        assert!(too_short(4800, 48000));
        // 1s at 48kHz
        assert!(!too_short(48000, 48000));
        assert!(too_short(48000, 0));
    }

    #[test]
    fn chat_body_carries_persona_and_prompt() {
        let settings = VoiceSettings::default();
        let body = chat_request_body(&settings, "what time is it");
        assert_eq!(body["model"], settings.chat_model.as_str());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "what time is it");
        assert_eq!(body["max_tokens"], settings.max_response_tokens);
    }
}
