//! Per-turn conversation state machine.
//!
//! All turn transitions go through the pure `reduce()` function, which
//! returns the next phase and a list of effects for the driver to execute.
//! The driver loop is the single consumer of the session's event channel, so
//! inbound events are applied in exactly the order they arrive.
//!
//! Key rules:
//! - Never mutate phase outside the reducer
//! - Ignore events carrying stale turn ids
//! - At most one non-terminal turn exists at a time

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::StreamConnection;
use super::pipeline::{AudioPipeline, FlushOutcome};
use super::protocol::{ClientEvent, ServerEvent};
use crate::status::{StatusHandle, VoiceState};

/// Failed responses are retried this many times before the turn errors out.
const MAX_RESPONSE_RETRIES: u32 = 3;

/// Linear backoff unit: retry N waits N times this before resending.
const RETRY_BACKOFF_UNIT: Duration = Duration::from_secs(2);

/// Settle delay between the commit ack and requesting a response.
const COMMIT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Phase of the current turn. `Erroring` is terminal for the turn but not
/// for the session: a fresh turn can start once the link recovers.
#[derive(Debug, Clone)]
pub enum TurnPhase {
    Idle,
    Listening {
        turn: Uuid,
        started_at: Instant,
        speech_detected: bool,
    },
    Committing {
        turn: Uuid,
    },
    AwaitingResponse {
        turn: Uuid,
        retry_count: u32,
    },
    Playing {
        turn: Uuid,
        retry_count: u32,
    },
    Erroring {
        message: String,
    },
}

impl Default for TurnPhase {
    fn default() -> Self {
        TurnPhase::Idle
    }
}

/// Events that can drive a turn transition. Sent from the button handler,
/// the connection's read loop, and the driver's own timers.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// User toggled the talk button.
    ButtonPressed,
    /// Recording reached the configured ceiling.
    MaxDurationReached { turn: Uuid },
    /// A scheduled response retry is due.
    RetryDue { turn: Uuid, attempt: u32 },
    /// The captured utterance was below the noise floor.
    BufferEmpty { turn: Uuid },
    /// Microphone could not be opened.
    CaptureFailed { turn: Uuid, error: String },
    /// Link handshake acknowledged.
    LinkUp,
    /// Socket lost; the connection layer is already reconnecting.
    LinkDown,
    /// Credential rejected. Fatal: requires an external key refresh.
    AuthFailed { message: String },
    /// Inbound event from the service.
    Server(ServerEvent),
}

/// Effects to be executed after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEffect {
    StartCapture { turn: Uuid },
    StopCapture,
    StartMaxTimer { turn: Uuid },
    /// Drain the capture buffer into paced appends plus a commit.
    FlushAndCommit { turn: Uuid },
    /// Enqueue `response.create`, optionally after a delay.
    RequestResponse { delay: Duration },
    ClearInput,
    Play { delta: String },
    StopPlayback,
    /// Fire `RetryDue` after the linear backoff for this attempt.
    ScheduleRetry { turn: Uuid, attempt: u32 },
    /// Last resort once retries are exhausted.
    TriggerReconnect,
    PublishStatus { state: VoiceState, message: String },
}

const READY_MESSAGE: &str = "Press the button to speak";

fn start_turn() -> (TurnPhase, Vec<TurnEffect>) {
    let turn = Uuid::new_v4();
    (
        TurnPhase::Listening {
            turn,
            started_at: Instant::now(),
            speech_detected: false,
        },
        vec![
            TurnEffect::StartCapture { turn },
            TurnEffect::StartMaxTimer { turn },
            TurnEffect::PublishStatus {
                state: VoiceState::Listening,
                message: "Recording...".to_string(),
            },
        ],
    )
}

fn stop_listening(turn: Uuid) -> (TurnPhase, Vec<TurnEffect>) {
    (
        TurnPhase::Committing { turn },
        vec![
            TurnEffect::StopCapture,
            TurnEffect::FlushAndCommit { turn },
            TurnEffect::PublishStatus {
                state: VoiceState::Processing,
                message: "Thinking...".to_string(),
            },
        ],
    )
}

/// Retry a failed response or, once retries are exhausted, kill the turn and
/// recycle the connection. The retry counter restarts at zero with the next
/// turn.
fn retry_or_error(turn: Uuid, retry_count: u32, playing: bool) -> (TurnPhase, Vec<TurnEffect>) {
    let mut effects = Vec::new();
    if playing {
        effects.push(TurnEffect::StopPlayback);
    }

    if retry_count < MAX_RESPONSE_RETRIES {
        let attempt = retry_count + 1;
        effects.push(TurnEffect::ClearInput);
        effects.push(TurnEffect::ScheduleRetry { turn, attempt });
        effects.push(TurnEffect::PublishStatus {
            state: VoiceState::Processing,
            message: format!("Retrying ({}/{})", attempt, MAX_RESPONSE_RETRIES),
        });
        (
            TurnPhase::AwaitingResponse {
                turn,
                retry_count: attempt,
            },
            effects,
        )
    } else {
        effects.push(TurnEffect::ClearInput);
        effects.push(TurnEffect::TriggerReconnect);
        effects.push(TurnEffect::PublishStatus {
            state: VoiceState::Error,
            message: "Voice service unavailable".to_string(),
        });
        (
            TurnPhase::Erroring {
                message: "Response retries exhausted".to_string(),
            },
            effects,
        )
    }
}

/// Reducer function: (phase, event) -> (next_phase, effects)
pub fn reduce(phase: &TurnPhase, event: TurnEvent) -> (TurnPhase, Vec<TurnEffect>) {
    use TurnEvent::*;
    use TurnPhase::*;

    // Current turn id, if a turn is in flight.
    let current_turn: Option<Uuid> = match phase {
        Idle | Erroring { .. } => None,
        Listening { turn, .. }
        | Committing { turn }
        | AwaitingResponse { turn, .. }
        | Playing { turn, .. } => Some(*turn),
    };
    let is_stale = |id: Uuid| Some(id) != current_turn;

    match (phase, event) {
        // -----------------
        // Idle / Erroring: a button press starts a fresh turn
        // -----------------
        (Idle, ButtonPressed) | (Erroring { .. }, ButtonPressed) => start_turn(),

        (Idle, LinkUp) | (Erroring { .. }, LinkUp) => (
            Idle,
            vec![TurnEffect::PublishStatus {
                state: VoiceState::Ready,
                message: READY_MESSAGE.to_string(),
            }],
        ),
        (Idle, LinkDown) => (
            Idle,
            vec![TurnEffect::PublishStatus {
                state: VoiceState::Degraded,
                message: "Reconnecting to voice service...".to_string(),
            }],
        ),

        // -----------------
        // Listening
        // -----------------
        (Listening { turn, .. }, ButtonPressed) => stop_listening(*turn),
        (Listening { turn, .. }, MaxDurationReached { turn: id }) if *turn == id => {
            log::warn!("Recording {} auto-stopped (max duration reached)", turn);
            stop_listening(*turn)
        }
        (
            Listening {
                turn, started_at, ..
            },
            Server(ServerEvent::SpeechStarted { .. }),
        ) => (
            Listening {
                turn: *turn,
                started_at: *started_at,
                speech_detected: true,
            },
            vec![],
        ),
        (Listening { turn, .. }, CaptureFailed { turn: id, error }) if *turn == id => (
            Erroring { message: error },
            vec![TurnEffect::PublishStatus {
                state: VoiceState::Error,
                message: "Microphone unavailable".to_string(),
            }],
        ),

        // -----------------
        // Committing
        // -----------------
        (Committing { turn }, Server(ServerEvent::AudioCommitted { .. })) => (
            AwaitingResponse {
                turn: *turn,
                retry_count: 0,
            },
            vec![TurnEffect::RequestResponse {
                delay: COMMIT_SETTLE_DELAY,
            }],
        ),
        (Committing { turn }, BufferEmpty { turn: id }) if *turn == id => (
            Idle,
            vec![
                TurnEffect::ClearInput,
                TurnEffect::PublishStatus {
                    state: VoiceState::Ready,
                    message: "Didn't catch that".to_string(),
                },
            ],
        ),

        // -----------------
        // Streaming playback: deltas play as they arrive
        // -----------------
        (
            AwaitingResponse { turn, retry_count },
            Server(ServerEvent::AudioDelta { delta }),
        ) => (
            Playing {
                turn: *turn,
                retry_count: *retry_count,
            },
            vec![
                TurnEffect::Play { delta },
                TurnEffect::PublishStatus {
                    state: VoiceState::Speaking,
                    message: "Playing response...".to_string(),
                },
            ],
        ),
        (Playing { turn, retry_count }, Server(ServerEvent::AudioDelta { delta })) => (
            Playing {
                turn: *turn,
                retry_count: *retry_count,
            },
            vec![TurnEffect::Play { delta }],
        ),

        // -----------------
        // Response finished
        // -----------------
        (AwaitingResponse { .. }, Server(ServerEvent::ResponseDone { response }))
        | (Playing { .. }, Server(ServerEvent::ResponseDone { response }))
            if !response.is_failed() =>
        {
            (
                Idle,
                vec![TurnEffect::PublishStatus {
                    state: VoiceState::Ready,
                    message: READY_MESSAGE.to_string(),
                }],
            )
        }
        (AwaitingResponse { turn, retry_count }, Server(ServerEvent::ResponseDone { .. })) => {
            retry_or_error(*turn, *retry_count, false)
        }
        (Playing { turn, retry_count }, Server(ServerEvent::ResponseDone { .. })) => {
            retry_or_error(*turn, *retry_count, true)
        }

        (
            AwaitingResponse { turn, retry_count },
            RetryDue {
                turn: id,
                attempt,
            },
        ) if *turn == id && attempt == *retry_count => (
            AwaitingResponse {
                turn: *turn,
                retry_count: *retry_count,
            },
            vec![TurnEffect::RequestResponse {
                delay: Duration::ZERO,
            }],
        ),

        // -----------------
        // Socket loss mid-turn kills the turn, not the session
        // -----------------
        (Listening { .. }, LinkDown)
        | (Committing { .. }, LinkDown)
        | (AwaitingResponse { .. }, LinkDown)
        | (Playing { .. }, LinkDown) => (
            Erroring {
                message: "Connection lost".to_string(),
            },
            vec![
                TurnEffect::StopCapture,
                TurnEffect::StopPlayback,
                TurnEffect::PublishStatus {
                    state: VoiceState::Degraded,
                    message: "Connection lost, reconnecting...".to_string(),
                },
            ],
        ),

        // -----------------
        // Fatal auth rejection
        // -----------------
        (_, AuthFailed { message }) => (
            Erroring { message },
            vec![
                TurnEffect::StopCapture,
                TurnEffect::StopPlayback,
                TurnEffect::PublishStatus {
                    state: VoiceState::Error,
                    message: "Authentication failed".to_string(),
                },
            ],
        ),

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, MaxDurationReached { turn }) if is_stale(turn) => (phase.clone(), vec![]),
        (_, RetryDue { turn, .. }) if is_stale(turn) => (phase.clone(), vec![]),
        (_, BufferEmpty { turn }) if is_stale(turn) => (phase.clone(), vec![]),
        (_, CaptureFailed { turn, .. }) if is_stale(turn) => (phase.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (phase.clone(), vec![]),
    }
}

/// Captions for the current turn, read by the panel each frame.
#[derive(Debug, Default, Clone)]
pub struct TurnCaptions {
    /// What the service heard the user say.
    pub transcript: String,
    /// Text caption of the streamed reply.
    pub response: String,
}

/// Driver that owns the event channel and executes effects against the
/// connection and the pipeline.
pub struct ConversationSession {
    phase: TurnPhase,
    events_rx: mpsc::Receiver<TurnEvent>,
    events_tx: mpsc::Sender<TurnEvent>,
    conn: StreamConnection,
    pipeline: Arc<AudioPipeline>,
    status: StatusHandle,
    captions: Arc<Mutex<TurnCaptions>>,
    instructions: String,
    max_recording: Duration,
    shutdown: CancellationToken,
}

impl ConversationSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events_rx: mpsc::Receiver<TurnEvent>,
        events_tx: mpsc::Sender<TurnEvent>,
        conn: StreamConnection,
        pipeline: Arc<AudioPipeline>,
        status: StatusHandle,
        captions: Arc<Mutex<TurnCaptions>>,
        instructions: String,
        max_recording: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            phase: TurnPhase::default(),
            events_rx,
            events_tx,
            conn,
            pipeline,
            status,
            captions,
            instructions,
            max_recording,
            shutdown,
        }
    }

    /// Run the session loop until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        log::info!("Conversation session loop started");

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.observe(&event);

            let (next, effects) = reduce(&self.phase, event);
            if mem::discriminant(&self.phase) != mem::discriminant(&next) {
                log::info!("Turn phase: {:?} -> {:?}", self.phase, next);
            }
            self.phase = next;

            for effect in effects {
                self.apply(effect).await;
            }
        }

        log::info!("Conversation session loop ended");
    }

    /// Side observations that never change the phase: captions and logging.
    fn observe(&self, event: &TurnEvent) {
        match event {
            TurnEvent::ButtonPressed => {
                if matches!(self.phase, TurnPhase::Idle | TurnPhase::Erroring { .. }) {
                    *self.captions.lock().unwrap() = TurnCaptions::default();
                }
            }
            TurnEvent::Server(ServerEvent::ItemCreated { item }) => {
                if let Some(transcript) = item.transcript() {
                    log::info!("Heard: {}", transcript);
                    self.captions.lock().unwrap().transcript = transcript.to_string();
                }
            }
            TurnEvent::Server(ServerEvent::TextDelta { delta }) => {
                self.captions.lock().unwrap().response.push_str(delta);
            }
            TurnEvent::Server(ServerEvent::Error { error }) if !error.is_auth_failure() => {
                log::warn!(
                    "Service error event ({}): {}",
                    error.code.as_deref().unwrap_or(&error.error_type),
                    error.message
                );
            }
            _ => {}
        }
    }

    async fn apply(&mut self, effect: TurnEffect) {
        match effect {
            TurnEffect::StartCapture { turn } => {
                let pipeline = self.pipeline.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.start_capture().await {
                        log::error!("Capture failed: {}", e);
                        let _ = events
                            .send(TurnEvent::CaptureFailed {
                                turn,
                                error: e.to_string(),
                            })
                            .await;
                    }
                });
            }
            TurnEffect::StopCapture => self.pipeline.stop_capture().await,
            TurnEffect::StartMaxTimer { turn } => {
                let events = self.events_tx.clone();
                let max = self.max_recording;
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(max) => {
                            let _ = events.send(TurnEvent::MaxDurationReached { turn }).await;
                        }
                    }
                });
            }
            TurnEffect::FlushAndCommit { turn } => {
                let pipeline = self.pipeline.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    match pipeline.flush_and_commit().await {
                        Ok(FlushOutcome::Committed { chunks }) => {
                            log::debug!("Turn {} committed in {} chunks", turn, chunks);
                        }
                        Ok(FlushOutcome::Empty) => {
                            let _ = events.send(TurnEvent::BufferEmpty { turn }).await;
                        }
                        Err(e) => {
                            // A dead socket surfaces separately as LinkDown.
                            log::warn!("Failed to send utterance: {}", e);
                        }
                    }
                });
            }
            TurnEffect::RequestResponse { delay } => {
                let conn = self.conn.clone();
                let instructions = self.instructions.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if let Err(e) = conn.enqueue(ClientEvent::response_create(&instructions)) {
                        log::warn!("Could not request response: {}", e);
                    }
                });
            }
            TurnEffect::ClearInput => {
                if let Err(e) = self.conn.enqueue(ClientEvent::AudioClear) {
                    log::warn!("Could not clear input buffer: {}", e);
                }
            }
            TurnEffect::Play { delta } => {
                if let Err(e) = self.pipeline.play_delta(&delta) {
                    log::warn!("Dropping undecodable audio delta: {}", e);
                }
            }
            TurnEffect::StopPlayback => self.pipeline.stop_playback(),
            TurnEffect::ScheduleRetry { turn, attempt } => {
                let events = self.events_tx.clone();
                let shutdown = self.shutdown.clone();
                let delay = RETRY_BACKOFF_UNIT * attempt;
                log::info!("Scheduling response retry {} in {:?}", attempt, delay);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = events.send(TurnEvent::RetryDue { turn, attempt }).await;
                        }
                    }
                });
            }
            TurnEffect::TriggerReconnect => self.conn.request_reconnect(),
            TurnEffect::PublishStatus { state, message } => self.status.set(state, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::ResponseSummary;

    fn done(failed: bool) -> TurnEvent {
        TurnEvent::Server(ServerEvent::ResponseDone {
            response: ResponseSummary {
                status: if failed { "failed" } else { "completed" }.to_string(),
            },
        })
    }

    fn listening(turn: Uuid) -> TurnPhase {
        TurnPhase::Listening {
            turn,
            started_at: Instant::now(),
            speech_detected: false,
        }
    }

    #[test]
    fn idle_button_starts_listening() {
        let (next, effects) = reduce(&TurnPhase::Idle, TurnEvent::ButtonPressed);
        assert!(matches!(next, TurnPhase::Listening { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::StartCapture { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::StartMaxTimer { .. })));
    }

    #[test]
    fn listening_button_commits() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(&listening(turn), TurnEvent::ButtonPressed);
        assert!(matches!(next, TurnPhase::Committing { .. }));
        assert!(effects.contains(&TurnEffect::StopCapture));
        assert!(effects.contains(&TurnEffect::FlushAndCommit { turn }));
    }

    #[test]
    fn max_duration_auto_stops() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(&listening(turn), TurnEvent::MaxDurationReached { turn });
        assert!(matches!(next, TurnPhase::Committing { .. }));
        assert!(effects.contains(&TurnEffect::FlushAndCommit { turn }));
    }

    #[test]
    fn stale_max_duration_is_ignored() {
        let turn = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(&listening(turn), TurnEvent::MaxDurationReached { turn: stale });
        assert!(matches!(next, TurnPhase::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn speech_started_sets_flag_without_effects() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &listening(turn),
            TurnEvent::Server(ServerEvent::SpeechStarted {
                audio_start_ms: Some(10),
            }),
        );
        match next {
            TurnPhase::Listening {
                speech_detected, ..
            } => assert!(speech_detected),
            _ => panic!("Expected Listening"),
        }
        assert!(effects.is_empty());
    }

    #[test]
    fn commit_ack_requests_response_after_settle() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::Committing { turn },
            TurnEvent::Server(ServerEvent::AudioCommitted { item_id: None }),
        );
        match next {
            TurnPhase::AwaitingResponse { retry_count, .. } => assert_eq!(retry_count, 0),
            _ => panic!("Expected AwaitingResponse"),
        }
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::RequestResponse { delay } if !delay.is_zero())));
    }

    #[test]
    fn empty_buffer_clears_and_returns_to_idle() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::Committing { turn },
            TurnEvent::BufferEmpty { turn },
        );
        assert!(matches!(next, TurnPhase::Idle));
        assert!(effects.contains(&TurnEffect::ClearInput));
    }

    #[test]
    fn first_delta_moves_to_playing() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::AwaitingResponse {
                turn,
                retry_count: 0,
            },
            TurnEvent::Server(ServerEvent::AudioDelta {
                delta: "AAAA".to_string(),
            }),
        );
        assert!(matches!(next, TurnPhase::Playing { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::Play { .. })));
    }

    #[test]
    fn successful_done_completes_turn() {
        let turn = Uuid::new_v4();
        let (next, _) = reduce(
            &TurnPhase::Playing {
                turn,
                retry_count: 2,
            },
            done(false),
        );
        assert!(matches!(next, TurnPhase::Idle));
    }

    #[test]
    fn first_failure_schedules_linear_retry() {
        // Scenario: response.done reports failed on the first attempt.
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::AwaitingResponse {
                turn,
                retry_count: 0,
            },
            done(true),
        );
        match next {
            TurnPhase::AwaitingResponse { retry_count, .. } => assert_eq!(retry_count, 1),
            _ => panic!("Expected AwaitingResponse"),
        }
        assert!(effects.contains(&TurnEffect::ClearInput));
        assert!(effects.contains(&TurnEffect::ScheduleRetry { turn, attempt: 1 }));
    }

    #[test]
    fn retry_counter_is_bounded() {
        // Drive a turn through repeated failures: the counter increments on
        // attempts 1, 2, 3 and the fourth failure kills the turn instead of
        // scheduling another retry.
        let turn = Uuid::new_v4();
        let mut phase = TurnPhase::AwaitingResponse {
            turn,
            retry_count: 0,
        };

        for expected in 1..=MAX_RESPONSE_RETRIES {
            let (next, effects) = reduce(&phase, done(true));
            match &next {
                TurnPhase::AwaitingResponse { retry_count, .. } => {
                    assert_eq!(*retry_count, expected)
                }
                other => panic!("Expected AwaitingResponse, got {:?}", other),
            }
            assert!(effects.contains(&TurnEffect::ScheduleRetry {
                turn,
                attempt: expected
            }));
            phase = next;
        }

        let (next, effects) = reduce(&phase, done(true));
        assert!(matches!(next, TurnPhase::Erroring { .. }));
        assert!(effects.contains(&TurnEffect::TriggerReconnect));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, TurnEffect::ScheduleRetry { .. })));
    }

    #[test]
    fn retry_due_resends_response_create() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::AwaitingResponse {
                turn,
                retry_count: 1,
            },
            TurnEvent::RetryDue { turn, attempt: 1 },
        );
        assert!(matches!(next, TurnPhase::AwaitingResponse { .. }));
        assert!(effects.contains(&TurnEffect::RequestResponse {
            delay: Duration::ZERO
        }));
    }

    #[test]
    fn outdated_retry_due_is_ignored() {
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::AwaitingResponse {
                turn,
                retry_count: 2,
            },
            TurnEvent::RetryDue { turn, attempt: 1 },
        );
        assert!(matches!(next, TurnPhase::AwaitingResponse { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn socket_loss_mid_playing_errors_turn() {
        // Scenario: the socket closes while audio is streaming out. The turn
        // dies but the session survives; reconnect happens below us.
        let turn = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnPhase::Playing {
                turn,
                retry_count: 0,
            },
            TurnEvent::LinkDown,
        );
        assert!(matches!(next, TurnPhase::Erroring { .. }));
        assert!(effects.contains(&TurnEffect::StopPlayback));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, TurnEffect::TriggerReconnect)));
    }

    #[test]
    fn link_recovery_clears_error() {
        let (next, effects) = reduce(
            &TurnPhase::Erroring {
                message: "Connection lost".to_string(),
            },
            TurnEvent::LinkUp,
        );
        assert!(matches!(next, TurnPhase::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::PublishStatus { state: VoiceState::Ready, .. })));
    }

    #[test]
    fn button_after_error_starts_fresh_turn() {
        let (next, effects) = reduce(
            &TurnPhase::Erroring {
                message: "Response retries exhausted".to_string(),
            },
            TurnEvent::ButtonPressed,
        );
        assert!(matches!(next, TurnPhase::Listening { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, TurnEffect::StartCapture { .. })));
    }

    #[test]
    fn auth_failure_is_terminal_from_any_phase() {
        let turn = Uuid::new_v4();
        for phase in [
            TurnPhase::Idle,
            listening(turn),
            TurnPhase::AwaitingResponse {
                turn,
                retry_count: 1,
            },
        ] {
            let (next, effects) = reduce(
                &phase,
                TurnEvent::AuthFailed {
                    message: "bad key".to_string(),
                },
            );
            assert!(matches!(next, TurnPhase::Erroring { .. }));
            assert!(effects
                .iter()
                .any(|e| matches!(e, TurnEffect::PublishStatus { state: VoiceState::Error, .. })));
        }
    }

    #[test]
    fn idle_ignores_socket_loss_quietly() {
        let (next, effects) = reduce(&TurnPhase::Idle, TurnEvent::LinkDown);
        assert!(matches!(next, TurnPhase::Idle));
        // Only a status repaint, no capture/playback effects.
        assert_eq!(effects.len(), 1);
    }
}
