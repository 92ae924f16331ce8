//! Integration tests for the backend failover manager.
//!
//! Exercises the health loop and delegation against scripted backends: no
//! network, no audio devices, short health intervals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirror_voice::{
    DrawSurface, ManagerTuning, PanelRect, Rgb, StatusReport, VoiceBackend, VoiceManager,
    VoiceState,
};

/// Backend with scriptable health and call counters.
struct MockBackend {
    name: &'static str,
    healthy: AtomicBool,
    presses: AtomicUsize,
    cleanups: AtomicUsize,
}

impl MockBackend {
    fn new(name: &'static str, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            healthy: AtomicBool::new(healthy),
            presses: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }

    fn set_healthy(&self, value: bool) {
        self.healthy.store(value, Ordering::SeqCst);
    }
}

impl VoiceBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn on_button_press(&self) {
        self.presses.fetch_add(1, Ordering::SeqCst);
    }

    fn update(&self) {}

    fn draw(&self, _surface: &mut dyn DrawSurface, _rect: PanelRect) {}

    fn status(&self) -> StatusReport {
        StatusReport::new(VoiceState::Ready, self.name)
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Surface that only counts calls; the manager draws its own panel on it.
#[derive(Default)]
struct CountingSurface {
    calls: usize,
}

impl DrawSurface for CountingSurface {
    fn fill_rect(&mut self, _rect: PanelRect, _color: Rgb) {
        self.calls += 1;
    }
    fn stroke_rect(&mut self, _rect: PanelRect, _color: Rgb, _width: u32) {
        self.calls += 1;
    }
    fn circle(&mut self, _cx: i32, _cy: i32, _radius: u32, _color: Rgb) {
        self.calls += 1;
    }
    fn text(&mut self, _x: i32, _y: i32, _size: u32, _color: Rgb, _text: &str) {
        self.calls += 1;
    }
}

fn fast_tuning() -> ManagerTuning {
    ManagerTuning {
        health_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_millis(500),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_happens_within_one_health_interval() {
    let streaming = MockBackend::new("realtime", true);
    let fallback = MockBackend::new("fallback", true);

    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        true,
        fast_tuning(),
    );

    assert_eq!(manager.active_name(), Some("realtime"));

    streaming.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.active_name(), Some("fallback"));

    manager.cleanup();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_switches_back_to_streaming() {
    let streaming = MockBackend::new("realtime", false);
    let fallback = MockBackend::new("fallback", true);

    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        true,
        fast_tuning(),
    );

    // Initially active is streaming (constructed first); the first health
    // tick moves off it because it is unhealthy.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.active_name(), Some("fallback"));

    streaming.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.active_name(), Some("realtime"));

    manager.cleanup();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_streaming_never_reactivates() {
    let streaming = MockBackend::new("realtime", true);
    let fallback = MockBackend::new("fallback", true);

    // Streaming disabled by configuration: even a healthy streaming backend
    // must not take over from the fallback.
    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        false,
        fast_tuning(),
    );

    // Constructed-first streaming starts active; break it once.
    streaming.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.active_name(), Some("fallback"));

    streaming.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.active_name(), Some("fallback"));

    manager.cleanup();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn button_presses_reach_the_active_backend() {
    let streaming = MockBackend::new("realtime", true);
    let fallback = MockBackend::new("fallback", true);

    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        true,
        fast_tuning(),
    );

    manager.on_button_press();
    manager.update();
    assert_eq!(streaming.presses.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.presses.load(Ordering::SeqCst), 0);

    streaming.set_healthy(false);
    tokio::time::sleep(Duration::from_millis(300)).await;

    manager.on_button_press();
    assert_eq!(fallback.presses.load(Ordering::SeqCst), 1);

    manager.cleanup();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_is_idempotent() {
    let streaming = MockBackend::new("realtime", true);
    let fallback = MockBackend::new("fallback", true);

    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        true,
        fast_tuning(),
    );

    manager.cleanup();
    manager.cleanup();

    assert_eq!(streaming.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_manager_reports_error_and_draws_own_panel() {
    let manager = VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        None,
        None,
        true,
        fast_tuning(),
    );

    assert_eq!(manager.active_name(), None);
    assert_eq!(manager.status().state, VoiceState::Error);

    let mut surface = CountingSurface::default();
    manager.draw(&mut surface, PanelRect::new(0, 0, 250, 200));
    assert!(surface.calls > 0);

    // Input with no backend must be a no-op, not a panic.
    manager.on_button_press();
    manager.update();

    manager.cleanup();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_never_see_a_torn_switch() {
    let streaming = MockBackend::new("realtime", true);
    let fallback = MockBackend::new("fallback", true);

    let manager = Arc::new(VoiceManager::with_backends(
        &tokio::runtime::Handle::current(),
        Some(streaming.clone()),
        Some(fallback.clone()),
        true,
        ManagerTuning {
            health_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(500),
        },
    ));

    // Flip streaming health rapidly while two readers poll the active
    // backend; every read must observe one of the two valid values.
    let flipper = {
        let streaming = streaming.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                streaming.set_healthy(i % 2 == 0);
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let name = manager.active_name();
                    assert!(
                        name == Some("realtime") || name == Some("fallback"),
                        "torn read: {:?}",
                        name
                    );
                }
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }
    flipper.join().unwrap();

    manager.cleanup();
}
