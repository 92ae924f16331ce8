//! Backend failover manager.
//!
//! Presents one logical voice backend to the kiosk even though two
//! independently-failing implementations exist underneath. A periodic health
//! loop refreshes both descriptors and swaps the single active reference
//! under one mutex, so concurrent callers always observe a consistent
//! backend and a switch is atomic from their point of view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{FallbackVoiceBackend, RealtimeVoiceBackend, VoiceBackend};
use crate::audio::{MicrophoneSource, SpeakerSink};
use crate::panel;
use crate::settings::VoiceSettings;
use crate::status::{StatusHandle, StatusReport, VoiceState};
use crate::streaming::connection::ConnectionTuning;
use crate::surface::{DrawSurface, PanelRect};

const PANEL_TITLE: &str = "Voice AI";

/// Timing knobs, defaulted for production and shortened in tests.
#[derive(Debug, Clone)]
pub struct ManagerTuning {
    /// Interval between health evaluations.
    pub health_interval: Duration,
    /// Bounded wait for worker shutdown during cleanup.
    pub shutdown_timeout: Duration,
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Which slot is currently exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveSlot {
    Streaming,
    Fallback,
    None,
}

/// Health bookkeeping for one backend.
struct BackendDescriptor {
    name: &'static str,
    backend: Arc<dyn VoiceBackend>,
    healthy: bool,
    last_checked: Option<Instant>,
}

impl BackendDescriptor {
    fn new(name: &'static str, backend: Arc<dyn VoiceBackend>) -> Self {
        Self {
            name,
            backend,
            healthy: false,
            last_checked: None,
        }
    }
}

struct Slots {
    streaming: Option<BackendDescriptor>,
    fallback: Option<BackendDescriptor>,
    active: ActiveSlot,
}

/// Failover rules, evaluated in order:
/// 1. Active streaming backend went unhealthy and the fallback is healthy:
///    switch to the fallback.
/// 2. Active fallback, streaming enabled by configuration and healthy again:
///    switch back to streaming.
/// 3. Otherwise no change.
fn next_active(
    active: ActiveSlot,
    streaming_healthy: Option<bool>,
    fallback_healthy: Option<bool>,
    streaming_enabled: bool,
) -> ActiveSlot {
    match active {
        ActiveSlot::Streaming => {
            if streaming_healthy != Some(true) && fallback_healthy == Some(true) {
                ActiveSlot::Fallback
            } else {
                active
            }
        }
        ActiveSlot::Fallback => {
            if streaming_enabled && streaming_healthy == Some(true) {
                ActiveSlot::Streaming
            } else {
                active
            }
        }
        ActiveSlot::None => ActiveSlot::None,
    }
}

pub struct VoiceManager {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    slots: Arc<Mutex<Slots>>,
    /// The manager's own report, shown when no backend is active.
    status: StatusHandle,
    tuning: ManagerTuning,
    shutdown: CancellationToken,
    cleaned: AtomicBool,
}

impl VoiceManager {
    /// Build both backends and start the health loop on a dedicated runtime.
    ///
    /// The streaming backend is attempted first; whichever backend could be
    /// constructed becomes initially active. With neither usable the manager
    /// stays alive and reports a permanent error status.
    pub fn new(
        settings: VoiceSettings,
        mic: Arc<dyn MicrophoneSource>,
        speaker: Arc<dyn SpeakerSink>,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("voice-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let streaming: Option<Arc<dyn VoiceBackend>> = if settings.streaming_enabled {
            match RealtimeVoiceBackend::new(
                &settings,
                ConnectionTuning::default(),
                mic.clone(),
                speaker.clone(),
                &handle,
            ) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    log::warn!("Realtime backend unavailable: {}", e);
                    None
                }
            }
        } else {
            log::info!("Streaming disabled by configuration");
            None
        };

        let fallback: Option<Arc<dyn VoiceBackend>> =
            match FallbackVoiceBackend::new(&settings, mic, speaker, handle.clone()) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    log::warn!("Fallback backend unavailable: {}", e);
                    None
                }
            };

        Ok(Self::assemble(
            Some(runtime),
            &handle,
            streaming,
            fallback,
            settings.streaming_enabled,
            ManagerTuning::default(),
        ))
    }

    /// Construct with explicit backends on an existing runtime. Used by
    /// embedding hosts and tests.
    pub fn with_backends(
        handle: &tokio::runtime::Handle,
        streaming: Option<Arc<dyn VoiceBackend>>,
        fallback: Option<Arc<dyn VoiceBackend>>,
        streaming_enabled: bool,
        tuning: ManagerTuning,
    ) -> Self {
        Self::assemble(None, handle, streaming, fallback, streaming_enabled, tuning)
    }

    fn assemble(
        runtime: Option<tokio::runtime::Runtime>,
        handle: &tokio::runtime::Handle,
        streaming: Option<Arc<dyn VoiceBackend>>,
        fallback: Option<Arc<dyn VoiceBackend>>,
        streaming_enabled: bool,
        tuning: ManagerTuning,
    ) -> Self {
        let active = if streaming.is_some() {
            ActiveSlot::Streaming
        } else if fallback.is_some() {
            ActiveSlot::Fallback
        } else {
            ActiveSlot::None
        };

        let status = match active {
            ActiveSlot::None => {
                StatusHandle::new(VoiceState::Error, "Voice systems unavailable")
            }
            _ => StatusHandle::new(VoiceState::Initializing, "Starting voice systems..."),
        };

        log::info!("Initial voice backend: {:?}", active);

        let slots = Arc::new(Mutex::new(Slots {
            streaming: streaming.map(|b| BackendDescriptor::new("realtime", b)),
            fallback: fallback.map(|b| BackendDescriptor::new("fallback", b)),
            active,
        }));

        let shutdown = CancellationToken::new();
        handle.spawn(health_loop(
            slots.clone(),
            streaming_enabled,
            tuning.health_interval,
            shutdown.clone(),
        ));

        Self {
            runtime: Mutex::new(runtime),
            slots,
            status,
            tuning,
            shutdown,
            cleaned: AtomicBool::new(false),
        }
    }

    /// The currently active backend, if any. The lock is held only for the
    /// reference swap, never across delegated calls.
    fn active_backend(&self) -> Option<Arc<dyn VoiceBackend>> {
        let slots = self.slots.lock().unwrap();
        match slots.active {
            ActiveSlot::Streaming => slots.streaming.as_ref().map(|d| d.backend.clone()),
            ActiveSlot::Fallback => slots.fallback.as_ref().map(|d| d.backend.clone()),
            ActiveSlot::None => None,
        }
    }

    /// Instant of the most recent health evaluation, for diagnostics.
    pub fn last_health_check(&self) -> Option<Instant> {
        let slots = self.slots.lock().unwrap();
        let streaming = slots.streaming.as_ref().and_then(|d| d.last_checked);
        let fallback = slots.fallback.as_ref().and_then(|d| d.last_checked);
        streaming.max(fallback)
    }

    /// Name of the active backend, for diagnostics.
    pub fn active_name(&self) -> Option<&'static str> {
        let slots = self.slots.lock().unwrap();
        match slots.active {
            ActiveSlot::Streaming => slots.streaming.as_ref().map(|d| d.name),
            ActiveSlot::Fallback => slots.fallback.as_ref().map(|d| d.name),
            ActiveSlot::None => None,
        }
    }

    /// Toggle start/stop of a turn on the active backend.
    pub fn on_button_press(&self) {
        if let Some(backend) = self.active_backend() {
            backend.on_button_press();
        } else {
            log::warn!("Button press with no active voice backend");
        }
    }

    /// Per-frame housekeeping; non-blocking.
    pub fn update(&self) {
        if let Some(backend) = self.active_backend() {
            backend.update();
        }
    }

    /// Paint the active backend's panel, or the manager's own error panel.
    pub fn draw(&self, surface: &mut dyn DrawSurface, rect: PanelRect) {
        match self.active_backend() {
            Some(backend) => backend.draw(surface, rect),
            None => panel::draw_panel(surface, rect, PANEL_TITLE, &self.status.report(), None),
        }
    }

    /// Latest status of the active backend (or the manager's own).
    pub fn status(&self) -> StatusReport {
        match self.active_backend() {
            Some(backend) => backend.status(),
            None => self.status.report(),
        }
    }

    /// Release all resources and join workers with a bounded timeout.
    /// Idempotent: a second call does nothing.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            log::debug!("Cleanup already performed");
            return;
        }
        log::info!("Voice manager cleanup");
        self.shutdown.cancel();

        {
            let slots = self.slots.lock().unwrap();
            if let Some(d) = &slots.streaming {
                d.backend.cleanup();
            }
            if let Some(d) = &slots.fallback {
                d.backend.cleanup();
            }
        }

        // A hung worker must not prevent process shutdown.
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_timeout(self.tuning.shutdown_timeout);
        }
    }
}

/// Periodic health evaluation. The first check fires one full interval after
/// startup so the streaming backend gets a chance to finish its handshake.
async fn health_loop(
    slots: Arc<Mutex<Slots>>,
    streaming_enabled: bool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut slots = slots.lock().unwrap();
        let now = Instant::now();

        let streaming_healthy = slots.streaming.as_mut().map(|d| {
            d.healthy = d.backend.healthy();
            d.last_checked = Some(now);
            d.healthy
        });
        let fallback_healthy = slots.fallback.as_mut().map(|d| {
            d.healthy = d.backend.healthy();
            d.last_checked = Some(now);
            d.healthy
        });

        let next = next_active(
            slots.active,
            streaming_healthy,
            fallback_healthy,
            streaming_enabled,
        );

        if next != slots.active {
            log::warn!(
                "Switching active voice backend: {:?} -> {:?} (streaming healthy: {:?}, fallback healthy: {:?})",
                slots.active,
                next,
                streaming_healthy,
                fallback_healthy
            );
            slots.active = next;
        }
    }

    log::debug!("Health loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_streaming_fails_over() {
        let next = next_active(ActiveSlot::Streaming, Some(false), Some(true), true);
        assert_eq!(next, ActiveSlot::Fallback);
    }

    #[test]
    fn streaming_stays_active_without_healthy_fallback() {
        // Nothing to switch to; the degraded streaming backend keeps trying.
        let next = next_active(ActiveSlot::Streaming, Some(false), Some(false), true);
        assert_eq!(next, ActiveSlot::Streaming);

        let next = next_active(ActiveSlot::Streaming, Some(false), None, true);
        assert_eq!(next, ActiveSlot::Streaming);
    }

    #[test]
    fn healthy_streaming_is_not_disturbed() {
        let next = next_active(ActiveSlot::Streaming, Some(true), Some(true), true);
        assert_eq!(next, ActiveSlot::Streaming);
    }

    #[test]
    fn recovery_switches_back_to_streaming() {
        let next = next_active(ActiveSlot::Fallback, Some(true), Some(true), true);
        assert_eq!(next, ActiveSlot::Streaming);
    }

    #[test]
    fn disabled_streaming_never_reactivates() {
        let next = next_active(ActiveSlot::Fallback, Some(true), Some(true), false);
        assert_eq!(next, ActiveSlot::Fallback);
    }

    #[test]
    fn empty_manager_stays_empty() {
        let next = next_active(ActiveSlot::None, None, None, true);
        assert_eq!(next, ActiveSlot::None);
    }
}
