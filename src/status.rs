//! Status reporting shared between the voice backends and the kiosk UI.
//!
//! The UI reads the current [`StatusReport`] on every draw call, so updates
//! must be cheap and atomic: each change replaces the whole value under a
//! short critical section, and readers always get a consistent snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// High-level state of the voice subsystem as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// Starting up, not yet usable.
    Initializing,
    /// Connected and waiting for the user.
    Ready,
    /// Recording the user's utterance.
    Listening,
    /// Utterance committed, waiting for the service to respond.
    Processing,
    /// Playing back the synthesized response.
    Speaking,
    /// Temporarily impaired (reconnecting, audio disabled, ...).
    Degraded,
    /// Unusable until something external changes (bad credential, no device).
    Error,
}

impl VoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceState::Initializing => "Initializing",
            VoiceState::Ready => "Ready",
            VoiceState::Listening => "Listening",
            VoiceState::Processing => "Processing",
            VoiceState::Speaking => "Speaking",
            VoiceState::Degraded => "Degraded",
            VoiceState::Error => "Error",
        }
    }
}

/// Immutable status snapshot published by a backend.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: VoiceState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(state: VoiceState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Shared handle to the latest status report.
///
/// Cloning the handle shares the underlying slot; `set` swaps in a fresh
/// report and `report` clones the current one. No caller ever holds the lock
/// across I/O.
#[derive(Clone)]
pub struct StatusHandle {
    slot: Arc<Mutex<StatusReport>>,
}

impl StatusHandle {
    pub fn new(state: VoiceState, message: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(StatusReport::new(state, message))),
        }
    }

    pub fn set(&self, state: VoiceState, message: impl Into<String>) {
        let report = StatusReport::new(state, message);
        log::info!("Status: {} - {}", report.state.as_str(), report.message);
        *self.slot.lock().unwrap() = report;
    }

    pub fn report(&self) -> StatusReport {
        self.slot.lock().unwrap().clone()
    }

    pub fn state(&self) -> VoiceState {
        self.slot.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_whole_report() {
        let handle = StatusHandle::new(VoiceState::Initializing, "Starting voice systems...");
        handle.set(VoiceState::Ready, "Press the button to speak");

        let report = handle.report();
        assert_eq!(report.state, VoiceState::Ready);
        assert_eq!(report.message, "Press the button to speak");
    }

    #[test]
    fn clones_share_the_same_slot() {
        let a = StatusHandle::new(VoiceState::Ready, "ok");
        let b = a.clone();
        b.set(VoiceState::Listening, "Recording...");
        assert_eq!(a.state(), VoiceState::Listening);
    }
}
