//! Stream-mode multiplexer.
//!
//! One bidirectional stream carries every request, response and server
//! push. Outbound writes are serialized through a single channel sender;
//! inbound messages are read by one dispatcher task that completes pending
//! requests by request id and forwards everything else as push events.
//! Listener work never runs on the dispatcher.

use crate::error::{ClientError, Result};
use crate::session::Stats;
use crate::transport::StreamClient;
use compass_proto as pb;
use dashmap::DashMap;
use pb::{client_message, server_message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue depth before senders start waiting.
const OUTBOUND_BUFFER: usize = 256;

/// Deadline for the server handshake response.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-initiated traffic and stream lifecycle signals, routed by the
/// session's push router.
#[derive(Debug)]
pub(crate) enum PushEvent {
    Pong(pb::Pong),
    ServiceChange(pb::ServiceChangeEvent),
    ConfigChange(pb::ConfigChangeEvent),
    CloseNotification(pb::CloseNotification),
    ServerError(pb::ServerError),
    StreamError(tonic::Status),
    StreamClosed,
}

/// The multiplexer over one live bidirectional stream.
///
/// A new instance is created per (re)connect; a terminated instance is
/// never revived.
pub(crate) struct StreamMux {
    outbound: Mutex<Option<mpsc::Sender<pb::ClientMessage>>>,
    pending: Arc<DashMap<String, oneshot::Sender<server_message::Payload>>>,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    dispatcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl StreamMux {
    /// Open the stream, perform the handshake and start the dispatcher.
    ///
    /// Fails with [`ClientError::Handshake`] when the server does not
    /// return a connection id within [`HANDSHAKE_TIMEOUT`].
    pub(crate) async fn open(
        mut client: StreamClient,
        handshake: pb::Handshake,
        request_timeout: Duration,
        push_tx: mpsc::UnboundedSender<PushEvent>,
        stats: Arc<Stats>,
    ) -> Result<(Arc<StreamMux>, pb::HandshakeAck)> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let response = client
            .connect(tonic::Request::new(ReceiverStream::new(rx)))
            .await
            .map_err(ClientError::from_status)?;
        let inbound = response.into_inner();

        let pending: Arc<DashMap<String, oneshot::Sender<server_message::Payload>>> =
            Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let mux = Arc::new(StreamMux {
            outbound: Mutex::new(Some(tx)),
            pending: pending.clone(),
            request_timeout,
            closed: closed.clone(),
            dispatcher: std::sync::Mutex::new(None),
            stats: stats.clone(),
        });

        let handle = tokio::spawn(dispatch_loop(inbound, pending, closed, push_tx, stats));
        if let Ok(mut guard) = mux.dispatcher.lock() {
            *guard = Some(handle);
        }

        let payload = mux
            .send_request_with_timeout(
                client_message::Payload::Handshake(handshake),
                HANDSHAKE_TIMEOUT,
            )
            .await
            .map_err(|e| match e {
                ClientError::Timeout(_) => ClientError::Handshake(format!(
                    "no handshake response within {:?}",
                    HANDSHAKE_TIMEOUT
                )),
                other => ClientError::Handshake(other.to_string()),
            })?;

        match payload {
            server_message::Payload::HandshakeAck(ack) if !ack.connection_id.is_empty() => {
                debug!("Handshake complete, connection id {}", ack.connection_id);
                Ok((mux, ack))
            }
            server_message::Payload::HandshakeAck(_) => Err(ClientError::Handshake(
                "server returned an empty connection id".to_string(),
            )),
            _ => Err(ClientError::Handshake(
                "unexpected payload in handshake response".to_string(),
            )),
        }
    }

    /// Send a request and wait for its response, up to the configured
    /// request timeout.
    pub(crate) async fn send_request(
        &self,
        payload: client_message::Payload,
    ) -> Result<server_message::Payload> {
        self.send_request_with_timeout(payload, self.request_timeout)
            .await
    }

    pub(crate) async fn send_request_with_timeout(
        &self,
        payload: client_message::Payload,
        timeout: Duration,
    ) -> Result<server_message::Payload> {
        let sender = self.sender().await?;
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let message = pb::ClientMessage {
            request_id: request_id.clone(),
            payload: Some(payload),
        };
        if sender.send(message).await.is_err() {
            self.pending.remove(&request_id);
            return Err(ClientError::TransportUnavailable(
                "stream writer closed".to_string(),
            ));
        }
        self.stats.record_outbound();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ClientError::TransportUnavailable(
                "connection closed while waiting for response".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ClientError::Timeout(format!(
                    "no response for request {} within {:?}",
                    request_id, timeout
                )))
            }
        }
    }

    /// Fire-and-forget send. Used for subscription establishment where the
    /// interesting traffic arrives later as push events.
    pub(crate) async fn send_request_async(&self, payload: client_message::Payload) -> Result<()> {
        let sender = self.sender().await?;
        let message = pb::ClientMessage {
            request_id: Uuid::new_v4().to_string(),
            payload: Some(payload),
        };
        sender.send(message).await.map_err(|_| {
            ClientError::TransportUnavailable("stream writer closed".to_string())
        })?;
        self.stats.record_outbound();
        Ok(())
    }

    /// Send a keep-alive ping carrying the client clock.
    pub(crate) async fn send_ping(&self, client_time: i64) -> Result<()> {
        self.send_request_async(client_message::Payload::Ping(pb::Ping { client_time }))
            .await
    }

    /// Whether the dispatcher has exited (the stream is dead either way).
    pub(crate) fn is_terminated(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.dispatcher.lock() {
            Ok(guard) => guard.as_ref().map(|h| h.is_finished()).unwrap_or(true),
            Err(_) => true,
        }
    }

    /// Half-close the outbound side and fail every pending request with a
    /// closed-connection error. Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().await.take();
        let pending = self.pending.len();
        if pending > 0 {
            info!("Failing {} pending requests on stream close", pending);
        }
        self.pending.clear();
    }

    /// Abort the dispatcher. Used when tearing down a dead stream before a
    /// reconnect; a clean close lets the dispatcher drain instead.
    pub(crate) fn abort_dispatcher(&self) {
        if let Ok(mut guard) = self.dispatcher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    async fn sender(&self) -> Result<mpsc::Sender<pb::ClientMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState("stream closed".to_string()));
        }
        self.outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| ClientError::InvalidState("stream closed".to_string()))
    }
}

/// A response arrived whose payload does not match the request that was
/// sent. Indicates a server bug; surfaced as a local failure.
pub(crate) fn unexpected_payload(operation: &str) -> ClientError {
    ClientError::LocalFailure(format!(
        "unexpected payload type in response to {}",
        operation
    ))
}

async fn dispatch_loop(
    mut inbound: tonic::Streaming<pb::ServerMessage>,
    pending: Arc<DashMap<String, oneshot::Sender<server_message::Payload>>>,
    closed: Arc<AtomicBool>,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    stats: Arc<Stats>,
) {
    loop {
        match inbound.message().await {
            Ok(Some(message)) => {
                stats.record_inbound();
                let Some(payload) = message.payload else {
                    debug!("Inbound message without payload; ignoring");
                    continue;
                };

                // Responses first: a matching pending request consumes the
                // message regardless of payload type.
                if !message.request_id.is_empty() {
                    if let Some((_, waiter)) = pending.remove(&message.request_id) {
                        let _ = waiter.send(payload);
                        continue;
                    }
                }

                let event = match payload {
                    server_message::Payload::Pong(pong) => PushEvent::Pong(pong),
                    server_message::Payload::ServiceChange(event) => {
                        PushEvent::ServiceChange(event)
                    }
                    server_message::Payload::ConfigChange(event) => PushEvent::ConfigChange(event),
                    server_message::Payload::CloseNotification(notice) => {
                        PushEvent::CloseNotification(notice)
                    }
                    server_message::Payload::Error(error) => PushEvent::ServerError(error),
                    _ => {
                        debug!(
                            "Discarding orphan response (request id '{}' not pending)",
                            message.request_id
                        );
                        continue;
                    }
                };
                if push_tx.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!("Server half-closed the stream");
                let _ = push_tx.send(PushEvent::StreamClosed);
                break;
            }
            Err(status) => {
                if !closed.load(Ordering::SeqCst) {
                    warn!("Stream error: {}", status);
                }
                let _ = push_tx.send(PushEvent::StreamError(status));
                break;
            }
        }
    }

    // Dropping the waiters surfaces as closed-connection errors.
    pending.clear();
    debug!("Stream dispatcher exiting");
}
