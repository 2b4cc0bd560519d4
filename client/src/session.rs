//! Session lifecycle: connect, handshake, keep-alive, failure detection
//! and close.
//!
//! The session owns the transport. Managers hold a reference to the session
//! and talk downward only; the reconnect engine observes disconnect signals
//! through a channel the session exposes, so no component points back up.

use crate::config::{ClientConfig, ExchangeMode};
use crate::error::{is_disconnect_code, ClientError, Result};
use crate::stream::{PushEvent, StreamMux};
use crate::transport::{self, AuthInterceptor, ConfigClient, RegistryClient};
use compass_proto as pb;
use once_cell::sync::Lazy;
use pb::{client_message, server_message};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::failure::FailureTracker;

/// Process-wide client id, generated once and retained for the process
/// lifetime so reconnecting sessions present a stable identity.
static CLIENT_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Process start time reported in the handshake.
static PROCESS_START_MS: Lazy<i64> = Lazy::new(now_millis);

/// Consecutive transient failures before the session is marked
/// disconnected.
const DISCONNECT_THRESHOLD: u32 = 3;

/// Connectivity monitor period.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Grace given to the transport to drain on close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Current epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channel; `connect()` has not succeeded or the transport failed.
    Disconnected,
    /// Channel up, awaiting the server handshake.
    Handshaking,
    /// Fully operational.
    Connected,
    /// The reconnect engine is re-establishing the session.
    Reconnecting,
    /// Reconnect attempts exhausted. Terminal except for `close()`.
    Failed,
    /// Closed by the caller. Terminal; never auto-recovers.
    Closed,
}

/// Counters and RTT kept for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    last_rtt_micros: AtomicU64,
}

impl Stats {
    pub(crate) fn record_inbound(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outbound(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rtt(&self, rtt: Duration) {
        self.last_rtt_micros
            .store(rtt.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        let rtt = self.last_rtt_micros.load(Ordering::Relaxed);
        SessionStats {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            last_rtt: (rtt > 0).then(|| Duration::from_micros(rtt)),
        }
    }
}

/// Point-in-time session statistics.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Messages received on the stream.
    pub messages_in: u64,
    /// Messages sent on the stream.
    pub messages_out: u64,
    /// Most recent ping/pong round-trip time.
    pub last_rtt: Option<Duration>,
}

/// Signal sent to the reconnect engine when the session goes down.
#[derive(Debug)]
pub(crate) struct DisconnectSignal {
    pub(crate) reason: String,
    /// True when raised from the stream error handler; the engine bounds
    /// these retries separately.
    pub(crate) from_stream_error: bool,
}

/// Sinks the managers register to receive server pushes. The session routes
/// downward through these without knowing the managers.
#[derive(Default)]
struct PushHub {
    service: std::sync::Mutex<Option<mpsc::UnboundedSender<pb::ServiceChangeEvent>>>,
    config: std::sync::Mutex<Option<mpsc::UnboundedSender<pb::ConfigChangeEvent>>>,
}

struct SessionInner {
    config: ClientConfig,
    auth: AuthInterceptor,
    state: std::sync::Mutex<SessionState>,
    /// Serializes connect/close/reconnect transitions.
    lifecycle: AsyncMutex<()>,
    channel: RwLock<Option<tonic::transport::Channel>>,
    mux: RwLock<Option<Arc<StreamMux>>>,
    hub: PushHub,
    stats: Arc<Stats>,
    failure: FailureTracker,
    connection_id: std::sync::Mutex<Option<String>>,
    last_error: std::sync::Mutex<Option<String>>,
    disconnects: std::sync::Mutex<Option<mpsc::UnboundedSender<DisconnectSignal>>>,
    closed: AtomicBool,
    ever_connected: AtomicBool,
    draining: AtomicBool,
    background_started: AtomicBool,
    keepalive: std::sync::Mutex<Option<JoinHandle<()>>>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The authenticated transport session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Validate the configuration and prepare a disconnected session.
    pub(crate) fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let auth = AuthInterceptor::from_config(&config)?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                auth,
                state: std::sync::Mutex::new(SessionState::Disconnected),
                lifecycle: AsyncMutex::new(()),
                channel: RwLock::new(None),
                mux: RwLock::new(None),
                hub: PushHub::default(),
                stats: Arc::new(Stats::default()),
                failure: FailureTracker::new(DISCONNECT_THRESHOLD),
                connection_id: std::sync::Mutex::new(None),
                last_error: std::sync::Mutex::new(None),
                disconnects: std::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
                ever_connected: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                background_started: AtomicBool::new(false),
                keepalive: std::sync::Mutex::new(None),
                monitor: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Client configuration this session was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn mode(&self) -> ExchangeMode {
        self.inner.config.exchange_mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(SessionState::Failed)
    }

    /// Connected and not closed.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.state() == SessionState::Connected
    }

    /// Connection id returned by the server handshake, stream mode only.
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .connection_id
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Most recent background or terminal error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.snapshot()
    }

    /// Establish the session. Idempotent: a second call on a connected
    /// session is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState("client is closed".to_string()));
        }
        if self.state() == SessionState::Connected {
            debug!("connect() on a connected session is a no-op");
            return Ok(());
        }
        self.set_state(SessionState::Handshaking);
        match self.establish().await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.inner.ever_connected.store(true, Ordering::SeqCst);
                self.inner.failure.record_success();
                self.start_background();
                info!("Session connected ({:?} mode)", self.inner.config.exchange_mode);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Re-establish the session after a failure. Reconnect-engine only.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState("client is closed".to_string()));
        }
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.set_state(SessionState::Reconnecting);
        match self.establish().await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                self.inner.failure.record_success();
                info!("Session re-established");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        // Tear down any stale stream before building a new channel.
        if let Some(old) = self.inner.mux.write().await.take() {
            old.close().await;
            old.abort_dispatcher();
        }

        let channel = transport::build_channel(&self.inner.config).await?;
        *self.inner.channel.write().await = Some(channel.clone());

        if self.inner.config.exchange_mode == ExchangeMode::Stream {
            let client = transport::stream_stub(
                channel,
                self.inner.auth.clone(),
                self.inner.config.max_inbound_message_size,
            );
            let handshake = pb::Handshake {
                client_id: CLIENT_ID.clone(),
                sdk_version: env!("CARGO_PKG_VERSION").to_string(),
                start_time: *PROCESS_START_MS,
                categories: vec!["registry".to_string(), "config".to_string()],
                keep_alive_seconds: self.inner.config.heartbeat_interval.as_secs().max(1) as u32,
                namespace: self.inner.config.namespace.clone(),
            };
            let (push_tx, push_rx) = mpsc::unbounded_channel();
            let (mux, ack) = StreamMux::open(
                client,
                handshake,
                self.inner.config.request_timeout,
                push_tx,
                self.inner.stats.clone(),
            )
            .await?;
            if let Ok(mut guard) = self.inner.connection_id.lock() {
                *guard = Some(ack.connection_id);
            }
            *self.inner.mux.write().await = Some(mux);
            self.inner.draining.store(false, Ordering::SeqCst);
            self.spawn_push_router(push_rx);
        }
        Ok(())
    }

    /// Close the session. Idempotent, one-way and infallible: fails all
    /// pending requests, half-closes the stream, then drops the channel
    /// after a drain grace.
    pub async fn close(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Closed);

        for handle in [
            self.inner.keepalive.lock().ok().and_then(|mut g| g.take()),
            self.inner.monitor.lock().ok().and_then(|mut g| g.take()),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }

        if let Some(mux) = self.inner.mux.write().await.take() {
            mux.close().await;
            // Let the dispatcher drain server traffic before forcing it.
            let drained = tokio::time::timeout(CLOSE_GRACE, async {
                while !mux.is_terminated() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if drained.is_err() {
                mux.abort_dispatcher();
            }
        }
        *self.inner.channel.write().await = None;
        info!("Session closed");
    }

    /// Gate for public operations: closed or never-connected clients are
    /// rejected before any wire I/O.
    pub(crate) fn ensure_operational(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState("client is closed".to_string()));
        }
        if !self.inner.ever_connected.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState(
                "client is not connected; call connect() first".to_string(),
            ));
        }
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState(
                "server requested close; no new requests accepted".to_string(),
            ));
        }
        Ok(())
    }

    /// Unary registry stub over the current channel.
    pub(crate) async fn registry_client(&self) -> Result<RegistryClient> {
        let channel = self.current_channel().await?;
        Ok(transport::registry_stub(
            channel,
            self.inner.auth.clone(),
            self.inner.config.max_inbound_message_size,
        ))
    }

    /// Unary config stub over the current channel.
    pub(crate) async fn config_client(&self) -> Result<ConfigClient> {
        let channel = self.current_channel().await?;
        Ok(transport::config_stub(
            channel,
            self.inner.auth.clone(),
            self.inner.config.max_inbound_message_size,
        ))
    }

    async fn current_channel(&self) -> Result<tonic::transport::Channel> {
        self.inner.channel.read().await.clone().ok_or_else(|| {
            ClientError::TransportUnavailable("channel not established".to_string())
        })
    }

    /// Attach the per-call deadline. Deadlines are computed here, at call
    /// time, never at stub creation.
    pub(crate) fn with_deadline<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.inner.config.request_timeout);
        request
    }

    /// Await a unary call with the configured deadline enforced locally as
    /// well, recording transport outcomes against the failure tracker.
    pub(crate) async fn unary<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => {
                self.note_success();
                Ok(response.into_inner())
            }
            Ok(Err(status)) => Err(self.note_status(status)),
            Err(_) => Err(self.note_error(ClientError::Timeout(format!(
                "no response within {:?}",
                timeout
            )))),
        }
    }

    /// Stream-mode request/response over the shared stream.
    pub(crate) async fn roundtrip(
        &self,
        payload: client_message::Payload,
    ) -> Result<server_message::Payload> {
        let mux = self.current_mux().await?;
        match mux.send_request(payload).await {
            Ok(payload) => {
                self.note_success();
                Ok(payload)
            }
            Err(e) => Err(self.note_error(e)),
        }
    }

    /// Stream-mode fire-and-forget send.
    pub(crate) async fn send_async(&self, payload: client_message::Payload) -> Result<()> {
        let mux = self.current_mux().await?;
        mux.send_request_async(payload).await
    }

    async fn current_mux(&self) -> Result<Arc<StreamMux>> {
        self.inner.mux.read().await.clone().ok_or_else(|| {
            ClientError::TransportUnavailable("stream not established".to_string())
        })
    }

    /// Record a transport-level status from a unary call and convert it.
    /// Transient codes count toward the disconnect threshold.
    pub(crate) fn note_status(&self, status: tonic::Status) -> ClientError {
        if is_disconnect_code(status.code()) {
            let (_, crossed) = self.inner.failure.record_failure();
            if crossed {
                self.mark_disconnected(&format!("transport status {:?}", status.code()));
            }
        }
        ClientError::from_status(status)
    }

    pub(crate) fn note_error(&self, error: ClientError) -> ClientError {
        if error.is_transient() {
            let (_, crossed) = self.inner.failure.record_failure();
            if crossed {
                self.mark_disconnected(&error.to_string());
            }
        }
        error
    }

    /// Record a successful exchange.
    pub(crate) fn note_success(&self) {
        self.inner.failure.record_success();
    }

    /// Mark the session disconnected and wake the reconnect engine.
    pub(crate) fn mark_disconnected(&self, reason: &str) {
        self.mark_disconnected_inner(reason, false);
    }

    fn mark_disconnected_inner(&self, reason: &str, from_stream_error: bool) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            match *state {
                SessionState::Connected | SessionState::Handshaking => {
                    *state = SessionState::Disconnected;
                }
                SessionState::Disconnected | SessionState::Reconnecting => {}
                SessionState::Failed | SessionState::Closed => return,
            }
        }
        warn!("Session disconnected: {}", reason);
        if let Ok(guard) = self.inner.disconnects.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(DisconnectSignal {
                    reason: reason.to_string(),
                    from_stream_error,
                });
            }
        }
    }

    /// Terminal failure after reconnect exhaustion.
    pub(crate) fn fail(&self, error: &ClientError) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Failed);
        self.record_error(error);
        error!("Session entered FAILED state: {}", error);
    }

    /// The reconnect engine registers its signal sink here.
    pub(crate) fn set_disconnect_listener(&self, tx: mpsc::UnboundedSender<DisconnectSignal>) {
        if let Ok(mut guard) = self.inner.disconnects.lock() {
            *guard = Some(tx);
        }
    }

    /// The registry manager registers its push sink here.
    pub(crate) fn set_service_event_sink(&self, tx: mpsc::UnboundedSender<pb::ServiceChangeEvent>) {
        if let Ok(mut guard) = self.inner.hub.service.lock() {
            *guard = Some(tx);
        }
    }

    /// The configuration manager registers its push sink here.
    pub(crate) fn set_config_event_sink(&self, tx: mpsc::UnboundedSender<pb::ConfigChangeEvent>) {
        if let Ok(mut guard) = self.inner.hub.config.lock() {
            *guard = Some(tx);
        }
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut guard) = self.inner.state.lock() {
            *guard = next;
        }
    }

    fn record_error(&self, error: &ClientError) {
        if let Ok(mut guard) = self.inner.last_error.lock() {
            *guard = Some(error.to_string());
        }
    }

    fn spawn_push_router(&self, mut rx: mpsc::UnboundedReceiver<PushEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PushEvent::Pong(pong) => {
                        let rtt_ms = now_millis().saturating_sub(pong.client_time);
                        if rtt_ms >= 0 {
                            session
                                .inner
                                .stats
                                .record_rtt(Duration::from_millis(rtt_ms as u64));
                        }
                        session.note_success();
                    }
                    PushEvent::ServiceChange(event) => {
                        if let Ok(guard) = session.inner.hub.service.lock() {
                            if let Some(tx) = guard.as_ref() {
                                let _ = tx.send(event);
                            }
                        }
                    }
                    PushEvent::ConfigChange(event) => {
                        if let Ok(guard) = session.inner.hub.config.lock() {
                            if let Some(tx) = guard.as_ref() {
                                let _ = tx.send(event);
                            }
                        }
                    }
                    PushEvent::CloseNotification(notice) => {
                        session.handle_close_notification(notice);
                    }
                    PushEvent::ServerError(err) => {
                        warn!("Server error push {}: {}", err.code, err.message);
                        session.record_error(&ClientError::ServerError {
                            code: err.code,
                            message: err.message,
                        });
                    }
                    PushEvent::StreamError(status) => {
                        session.handle_stream_error(status);
                        break;
                    }
                    PushEvent::StreamClosed => {
                        if !session.inner.closed.load(Ordering::SeqCst)
                            && !session.inner.draining.load(Ordering::SeqCst)
                        {
                            session.mark_disconnected_inner("server closed the stream", true);
                        }
                        break;
                    }
                }
            }
            debug!("Push router exiting");
        });
    }

    fn handle_stream_error(&self, status: tonic::Status) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if is_client_initiated_close(&status) {
            debug!("Stream ended by client-side shutdown; not reconnecting");
            return;
        }
        self.mark_disconnected_inner(&format!("stream error: {}", status), true);
    }

    fn handle_close_notification(&self, notice: pb::CloseNotification) {
        warn!(
            "Server requested close: {} (grace {}s)",
            notice.reason, notice.grace_seconds
        );
        self.inner.draining.store(true, Ordering::SeqCst);
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(notice.grace_seconds as u64)).await;
            session.close().await;
        });
    }

    fn start_background(&self) {
        if self.inner.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.inner.config.exchange_mode == ExchangeMode::Stream {
            let session = self.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(session.inner.config.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if session.inner.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if session.state() != SessionState::Connected {
                        continue;
                    }
                    let mux = session.inner.mux.read().await.clone();
                    if let Some(mux) = mux {
                        if let Err(e) = mux.send_ping(now_millis()).await {
                            debug!("Keep-alive ping failed: {}", e);
                        }
                    }
                }
                debug!("Keep-alive task exiting");
            });
            if let Ok(mut guard) = self.inner.keepalive.lock() {
                *guard = Some(handle);
            }
        }

        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if session.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if session.state() != SessionState::Connected {
                    continue;
                }
                if session.inner.config.exchange_mode == ExchangeMode::Stream {
                    let dead = session
                        .inner
                        .mux
                        .read()
                        .await
                        .as_ref()
                        .map(|mux| mux.is_terminated())
                        .unwrap_or(true);
                    if dead {
                        session.mark_disconnected("stream dispatcher terminated");
                    }
                }
            }
            debug!("Connectivity monitor exiting");
        });
        if let Ok(mut guard) = self.inner.monitor.lock() {
            *guard = Some(handle);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        self.set_state(state);
        if state == SessionState::Connected {
            self.inner.ever_connected.store(true, Ordering::SeqCst);
        }
    }
}

/// A stream error of this shape is our own channel teardown, not a server
/// fault; it must not trigger reconnection.
fn is_client_initiated_close(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Unavailable
        && status.message().contains("Channel shutdownNow invoked")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ClientConfig::new("localhost:12004")).unwrap()
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session();
        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let session = session();
        let err = session.ensure_operational().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_operations_rejected_after_close() {
        let session = session();
        session.force_state(SessionState::Connected);
        session.ensure_operational().unwrap();
        session.close().await;
        assert!(matches!(
            session.ensure_operational(),
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_disconnected_signals_engine() {
        let session = session();
        session.force_state(SessionState::Connected);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_disconnect_listener(tx);

        session.mark_disconnected("test fault");
        assert_eq!(session.state(), SessionState::Disconnected);

        let signal = rx.try_recv().unwrap();
        assert!(signal.reason.contains("test fault"));
        assert!(!signal.from_stream_error);
    }

    #[tokio::test]
    async fn test_mark_disconnected_after_close_is_ignored() {
        let session = session();
        session.close().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_disconnect_listener(tx);
        session.mark_disconnected("too late");
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_client_initiated_close_detection() {
        let status = tonic::Status::unavailable("Channel shutdownNow invoked");
        assert!(is_client_initiated_close(&status));

        let status = tonic::Status::unavailable("connection reset by peer");
        assert!(!is_client_initiated_close(&status));

        let status = tonic::Status::aborted("Channel shutdownNow invoked");
        assert!(!is_client_initiated_close(&status));
    }

    #[test]
    fn test_client_id_is_stable() {
        assert_eq!(*CLIENT_ID, *CLIENT_ID);
        assert_eq!(CLIENT_ID.len(), 36);
    }
}
