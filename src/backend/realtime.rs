//! Realtime streaming voice backend.
//!
//! Wires the stream connection, the audio pipeline and the conversation
//! session together behind the [`VoiceBackend`] trait. The UI-facing methods
//! only enqueue events or read shared snapshots; everything else happens on
//! the runtime's worker tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::VoiceBackend;
use crate::audio::{MicrophoneSource, SpeakerSink};
use crate::panel;
use crate::settings::{self, VoiceSettings};
use crate::status::{StatusHandle, StatusReport, VoiceState};
use crate::streaming::connection::{ConnectionTuning, StreamConnection};
use crate::streaming::pipeline::AudioPipeline;
use crate::streaming::session::{ConversationSession, TurnCaptions, TurnEvent};
use crate::streaming::StreamingError;

const PANEL_TITLE: &str = "Voice AI";

/// Capacity of the session's inbound event channel.
const EVENT_CHANNEL_CAP: usize = 64;

pub struct RealtimeVoiceBackend {
    conn: StreamConnection,
    pipeline: Arc<AudioPipeline>,
    events_tx: mpsc::Sender<TurnEvent>,
    status: StatusHandle,
    captions: Arc<Mutex<TurnCaptions>>,
    shutdown: CancellationToken,
    cleaned: AtomicBool,
}

impl RealtimeVoiceBackend {
    /// Build the backend and spawn its worker loops on the given runtime.
    ///
    /// Fails only when no credential is configured; connection problems are
    /// handled by the supervisor and surface through `healthy()`.
    pub fn new(
        settings: &VoiceSettings,
        tuning: ConnectionTuning,
        mic: Arc<dyn MicrophoneSource>,
        speaker: Arc<dyn SpeakerSink>,
        handle: &tokio::runtime::Handle,
    ) -> Result<Arc<Self>, StreamingError> {
        let api_key = settings::api_key().ok_or(StreamingError::MissingApiKey)?;

        let status = StatusHandle::new(VoiceState::Initializing, "Starting voice systems...");
        let captions = Arc::new(Mutex::new(TurnCaptions::default()));
        let shutdown = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);

        let conn = StreamConnection::start(
            settings.clone(),
            api_key,
            tuning,
            events_tx.clone(),
            handle,
        );

        let pipeline = Arc::new(AudioPipeline::new(mic, speaker, conn.clone()));

        let session = ConversationSession::new(
            events_rx,
            events_tx.clone(),
            conn.clone(),
            pipeline.clone(),
            status.clone(),
            captions.clone(),
            settings.instructions.clone(),
            Duration::from_secs(settings.max_recording_secs),
            shutdown.clone(),
        );
        handle.spawn(session.run());

        Ok(Arc::new(Self {
            conn,
            pipeline,
            events_tx,
            status,
            captions,
            shutdown,
            cleaned: AtomicBool::new(false),
        }))
    }

    /// The underlying connection, exposed for diagnostics.
    pub fn connection(&self) -> &StreamConnection {
        &self.conn
    }

    fn caption(&self) -> Option<String> {
        let captions = self.captions.lock().unwrap();
        if !captions.response.is_empty() {
            Some(captions.response.clone())
        } else if !captions.transcript.is_empty() {
            Some(format!("You: {}", captions.transcript))
        } else {
            None
        }
    }
}

impl VoiceBackend for RealtimeVoiceBackend {
    fn name(&self) -> &'static str {
        "realtime"
    }

    fn on_button_press(&self) {
        if !self.conn.is_ready() {
            log::warn!("Button pressed but link is not ready");
            self.status
                .set(VoiceState::Degraded, "Voice service not connected");
            return;
        }
        // Never block the UI thread; a full channel drops the press.
        if self.events_tx.try_send(TurnEvent::ButtonPressed).is_err() {
            log::warn!("Session event channel full, dropping button press");
        }
    }

    fn update(&self) {
        self.pipeline.watchdog_tick();
    }

    fn draw(&self, surface: &mut dyn crate::surface::DrawSurface, rect: crate::surface::PanelRect) {
        let caption = self.caption();
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
        self.conn.is_ready() && !self.pipeline.is_disabled()
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Realtime backend cleanup");
        self.shutdown.cancel();
        self.pipeline.abort_capture();
        self.pipeline.stop_playback();
        self.conn.shutdown();
    }
}
