//! Voice backends and the failover manager.
//!
//! Two interchangeable implementations sit behind the [`VoiceBackend`]
//! trait: the realtime streaming backend (persistent connection, streamed
//! playback) and a simpler non-streaming fallback (record the whole
//! utterance, one request/response, synthesize once). The
//! [`VoiceManager`] owns both and exposes exactly one of them to the UI at
//! any time.

pub mod fallback;
pub mod manager;
pub mod realtime;

pub use fallback::FallbackVoiceBackend;
pub use manager::{ManagerTuning, VoiceManager};
pub use realtime::RealtimeVoiceBackend;

use crate::status::StatusReport;
use crate::surface::{DrawSurface, PanelRect};

/// A complete voice implementation the manager can delegate to.
///
/// All methods are called from the UI thread and must never block on the
/// network or on audio I/O.
pub trait VoiceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Toggle start/stop of a turn.
    fn on_button_press(&self);

    /// Advance per-frame housekeeping (watchdogs, status refresh).
    fn update(&self);

    /// Paint the status panel.
    fn draw(&self, surface: &mut dyn DrawSurface, rect: PanelRect);

    /// Latest status snapshot.
    fn status(&self) -> StatusReport;

    /// Whether this backend is currently fit to be active.
    fn healthy(&self) -> bool;

    /// Release resources. Idempotent.
    fn cleanup(&self);
}
