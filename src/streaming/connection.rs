//! Persistent WebSocket connection to the realtime service.
//!
//! One supervisor task owns the socket for its whole life: it connects,
//! splits the stream into a read loop and a write loop, and reconnects with a
//! flat delay whenever the socket dies. All outbound traffic is funneled
//! through a single bounded queue drained by the one writer, which is what
//! guarantees FIFO delivery; callers only ever enqueue.
//!
//! # Connection Flow
//!
//! 1. Connect with auth headers; the service emits `session.created`
//! 2. Enqueue the `session.update` configuration event
//! 3. Mark `Ready` on the service's ack (`session.created`/`session.updated`)
//! 4. If nothing acks within the readiness timeout, degrade but stay up;
//!    the health loop above decides what to do with a degraded link
//!
//! # Reconnect Policy
//!
//! Socket errors reconnect forever with a flat 2s delay. The connection layer
//! deliberately has no growing backoff: the backend health check is the
//! circuit breaker, and response-level retry backoff lives in the session
//! state machine.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientEvent, ServerEvent};
use super::session::TurnEvent;
use super::StreamingError;
use crate::settings::VoiceSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Socket not yet established or handshake still pending.
    Connecting,
    /// Handshake acknowledged; events flow in both directions.
    Ready,
    /// Up but impaired (handshake unacknowledged, or between reconnects).
    Degraded,
    /// Shut down or dead beyond recovery (auth rejection).
    Closed,
}

/// Timing knobs, defaulted for production and shortened in tests.
#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    /// Timeout for the initial TCP/TLS/WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long to wait for the service's session ack before degrading.
    pub readiness_timeout: Duration,
    /// Flat settle delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Soft cap on queued outbound events.
    pub send_queue_cap: usize,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            send_queue_cap: 256,
        }
    }
}

struct ConnInner {
    url: String,
    api_key: String,
    settings: VoiceSettings,
    tuning: ConnectionTuning,
    outbound_tx: mpsc::Sender<ClientEvent>,
    events: mpsc::Sender<TurnEvent>,
    status: Mutex<LinkStatus>,
    last_handshake_at: Mutex<Option<Instant>>,
    /// Guards against overlapping reconnect requests.
    reconnecting: AtomicBool,
    /// Cancelling the epoch tears down the current socket's loops.
    epoch: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl ConnInner {
    fn set_status(&self, next: LinkStatus) {
        let mut status = self.status.lock().unwrap();
        if *status != next {
            log::info!("Link status: {:?} -> {:?}", *status, next);
            *status = next;
        }
    }

    fn is_ready(&self) -> bool {
        *self.status.lock().unwrap() == LinkStatus::Ready
    }
}

/// Handle to the supervised connection.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<ConnInner>,
}

impl StreamConnection {
    /// Spawn the connection supervisor on the given runtime.
    pub fn start(
        settings: VoiceSettings,
        api_key: String,
        tuning: ConnectionTuning,
        events: mpsc::Sender<TurnEvent>,
        handle: &tokio::runtime::Handle,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(tuning.send_queue_cap);

        let inner = Arc::new(ConnInner {
            url: settings.realtime_url.clone(),
            api_key,
            settings,
            tuning,
            outbound_tx,
            events,
            status: Mutex::new(LinkStatus::Connecting),
            last_handshake_at: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            epoch: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
        });

        handle.spawn(supervise(inner.clone(), outbound_rx));

        Self { inner }
    }

    /// Enqueue an outbound event. Never blocks; the single writer loop
    /// preserves enqueue order on the wire.
    pub fn enqueue(&self, event: ClientEvent) -> Result<(), StreamingError> {
        self.inner
            .outbound_tx
            .try_send(event)
            .map_err(|e| StreamingError::SendFailed(e.to_string()))
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub fn last_handshake_at(&self) -> Option<Instant> {
        *self.inner.last_handshake_at.lock().unwrap()
    }

    /// Force the current socket down and let the supervisor rebuild it.
    /// A no-op while a reconnect is already in flight.
    pub fn request_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            log::debug!("Reconnect already in flight, ignoring request");
            return;
        }
        log::info!("Reconnect requested");
        self.inner.epoch.lock().unwrap().cancel();
    }

    /// Stop the supervisor and close the socket. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.epoch.lock().unwrap().cancel();
        self.inner.set_status(LinkStatus::Closed);
    }
}

async fn supervise(inner: Arc<ConnInner>, mut outbound_rx: mpsc::Receiver<ClientEvent>) {
    log::info!("Connection supervisor started");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.set_status(LinkStatus::Connecting);

        match connect_socket(&inner).await {
            Ok(ws) => {
                *inner.last_handshake_at.lock().unwrap() = Some(Instant::now());
                inner.reconnecting.store(false, Ordering::SeqCst);

                let epoch = CancellationToken::new();
                *inner.epoch.lock().unwrap() = epoch.clone();

                tokio::spawn(readiness_watchdog(inner.clone(), epoch.clone()));

                let (writer, reader) = ws.split();
                let writer_task = tokio::spawn(write_loop(
                    writer,
                    outbound_rx,
                    epoch.clone(),
                    inner.shutdown.clone(),
                ));

                let fatal = read_loop(reader, &inner, &epoch).await;
                epoch.cancel();

                // A writer stuck on a dead socket must not wedge the
                // supervisor; without the queue receiver the connection is
                // unrecoverable and the health check takes over.
                outbound_rx = match timeout(Duration::from_secs(2), writer_task).await {
                    Ok(Ok(rx)) => rx,
                    Ok(Err(e)) => {
                        log::error!("Writer task failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        log::warn!("Writer did not stop in time, closing connection");
                        break;
                    }
                };

                if fatal {
                    inner.set_status(LinkStatus::Closed);
                    return;
                }
            }
            Err(StreamingError::AuthenticationFailed(message)) => {
                log::error!("Authentication rejected: {}", message);
                inner.set_status(LinkStatus::Closed);
                let _ = inner.events.try_send(TurnEvent::AuthFailed { message });
                return;
            }
            Err(e) => {
                log::warn!("Connection attempt failed: {}", e);
            }
        }

        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.set_status(LinkStatus::Degraded);
        inner.reconnecting.store(true, Ordering::SeqCst);
        let _ = inner.events.try_send(TurnEvent::LinkDown);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.tuning.reconnect_delay) => {}
        }
    }

    inner.set_status(LinkStatus::Closed);
    log::info!("Connection supervisor exiting");
}

/// Single connection attempt with auth headers.
async fn connect_socket(inner: &ConnInner) -> Result<WsStream, StreamingError> {
    let mut request = inner
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", inner.api_key))
            .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?,
    );

    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    log::info!("Connecting to realtime service...");

    let (ws_stream, _response) = timeout(
        inner.tuning.connect_timeout,
        connect_async_with_config(request, None, false),
    )
    .await
    .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| match e {
        WsError::Http(response) if response.status().as_u16() == 401 => {
            StreamingError::AuthenticationFailed("Credential rejected (401)".to_string())
        }
        WsError::Http(response) if response.status().as_u16() == 403 => {
            StreamingError::AuthenticationFailed("Credential rejected (403)".to_string())
        }
        other => StreamingError::ConnectionFailed(other.to_string()),
    })?;

    log::info!("WebSocket connected, waiting for session ack");
    Ok(ws_stream)
}

/// Degrade the link if the handshake is not acknowledged in time. The socket
/// stays up; the health loop above decides whether to fail over.
async fn readiness_watchdog(inner: Arc<ConnInner>, epoch: CancellationToken) {
    tokio::select! {
        _ = epoch.cancelled() => {}
        _ = inner.shutdown.cancelled() => {}
        _ = tokio::time::sleep(inner.tuning.readiness_timeout) => {
            if !inner.is_ready() {
                log::warn!(
                    "Handshake not acknowledged within {:?}, marking link degraded",
                    inner.tuning.readiness_timeout
                );
                inner.set_status(LinkStatus::Degraded);
            }
        }
    }
}

/// Drain the outbound queue into the socket. Returns the receiver so the
/// next epoch's writer can pick up where this one left off.
async fn write_loop(
    mut writer: WsWriter,
    mut rx: mpsc::Receiver<ClientEvent>,
    epoch: CancellationToken,
    shutdown: CancellationToken,
) -> mpsc::Receiver<ClientEvent> {
    loop {
        tokio::select! {
            _ = epoch.cancelled() => break,
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            log::error!("Failed to serialize outbound event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(json)).await {
                        log::warn!("Socket write failed: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = writer.close().await;
    log::debug!("Writer loop exiting");
    rx
}

/// Parse and dispatch inbound frames until the socket dies or the epoch
/// ends. Returns true when a fatal auth error was observed.
async fn read_loop(mut reader: WsReader, inner: &Arc<ConnInner>, epoch: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            _ = epoch.cancelled() => return false,
            _ = inner.shutdown.cancelled() => return false,
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if dispatch_event(inner, event).await {
                                return true;
                            }
                        }
                        Err(e) => {
                            // Malformed events are dropped without touching
                            // any in-flight state.
                            log::warn!("Dropping malformed event: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    log::info!("WebSocket closed by server");
                    return false;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    return false;
                }
                None => return false,
            }
        }
    }
}

/// Handle handshake events at the connection layer and forward everything to
/// the session's event channel. Returns true on fatal auth errors.
async fn dispatch_event(inner: &Arc<ConnInner>, event: ServerEvent) -> bool {
    match &event {
        ServerEvent::SessionCreated { session } => {
            log::info!("Session created: {}", session.id);
            let config = ClientEvent::session_update(&inner.settings);
            if inner.outbound_tx.try_send(config).is_err() {
                log::warn!("Send queue full, could not enqueue session configuration");
            }
            if !inner.is_ready() {
                inner.set_status(LinkStatus::Ready);
                let _ = inner.events.send(TurnEvent::LinkUp).await;
            }
        }
        ServerEvent::SessionUpdated { session } => {
            log::info!("Session configured: {:?}", session.modalities);
            if !inner.is_ready() {
                inner.set_status(LinkStatus::Ready);
                let _ = inner.events.send(TurnEvent::LinkUp).await;
            }
        }
        ServerEvent::Error { error } if error.is_auth_failure() => {
            log::error!("Fatal auth error from service: {}", error.message);
            let _ = inner
                .events
                .send(TurnEvent::AuthFailed {
                    message: error.message.clone(),
                })
                .await;
            return true;
        }
        _ => {}
    }

    if inner.events.send(TurnEvent::Server(event)).await.is_err() {
        log::debug!("Session event channel closed");
    }
    false
}
