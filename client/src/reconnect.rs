//! Reconnect and state-restoration engine.
//!
//! The engine owns nothing but a reference to the session and a table of
//! restorables the managers publish at construction. Disconnect signals
//! arrive over a channel; each signal drives one backoff-retry cycle, and a
//! successful reconnect replays every restorable (node re-registrations,
//! subscriptions, watches) before listeners are told the session is back.

use crate::error::{ClientError, Result};
use crate::session::{DisconnectSignal, Session, SessionState};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry bound for cycles triggered by a stream error.
const STREAM_ERROR_ATTEMPTS: i32 = 5;

/// State a manager can re-establish after a reconnect.
#[async_trait]
pub(crate) trait Restorable: Send + Sync {
    fn name(&self) -> &'static str;
    /// Re-establish server-side state with identifiers preserved.
    async fn restore(&self) -> Result<()>;
    /// Tell this manager's listeners the session is back.
    fn notify_reconnected(&self);
}

/// Drives backoff-retry reconnects and state restoration.
pub(crate) struct ReconnectEngine {
    session: Session,
    restorables: RwLock<Vec<Arc<dyn Restorable>>>,
}

impl ReconnectEngine {
    pub(crate) fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session,
            restorables: RwLock::new(Vec::new()),
        })
    }

    /// Register a restorable. Managers call this once at construction.
    pub(crate) fn add_restorable(&self, restorable: Arc<dyn Restorable>) {
        if let Ok(mut guard) = self.restorables.write() {
            guard.push(restorable);
        }
    }

    /// Consume disconnect signals for the life of the client.
    pub(crate) fn start(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<DisconnectSignal>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                // Collapse a burst of signals into one cycle.
                while let Ok(extra) = rx.try_recv() {
                    debug!("Coalescing disconnect signal: {}", extra.reason);
                }
                engine.run_cycle(signal).await;
            }
            debug!("Reconnect engine exiting");
        });
    }

    async fn run_cycle(&self, signal: DisconnectSignal) {
        match self.session.state() {
            SessionState::Closed | SessionState::Failed | SessionState::Connected => return,
            _ => {}
        }
        info!("Reconnect cycle started: {}", signal.reason);

        let config = self.session.config();
        let max_attempts = config.max_reconnect_attempts;
        // Stream-error cycles are bounded tighter than the general limit.
        let limit = if signal.from_stream_error {
            if max_attempts < 0 {
                STREAM_ERROR_ATTEMPTS
            } else {
                max_attempts.min(STREAM_ERROR_ATTEMPTS)
            }
        } else {
            max_attempts
        };

        let mut backoff = config.reconnect_interval;
        let mut attempts: i32 = 0;
        loop {
            if self.session.state() == SessionState::Closed {
                return;
            }
            attempts += 1;
            match self.session.reconnect().await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempts);
                    self.restore_all().await;
                    return;
                }
                Err(ClientError::InvalidState(_)) => {
                    // Client closed while we were retrying.
                    return;
                }
                Err(e) => {
                    warn!(
                        "Reconnect attempt {} failed: {}; next in {:?}",
                        attempts, e, backoff
                    );
                    if limit >= 0 && attempts >= limit {
                        error!("Reconnect attempts exhausted after {}", attempts);
                        self.session.fail(&e);
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    async fn restore_all(&self) {
        let restorables: Vec<Arc<dyn Restorable>> = match self.restorables.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for restorable in &restorables {
            if let Err(e) = restorable.restore().await {
                warn!("State restoration for {} failed: {}", restorable.name(), e);
            }
        }
        for restorable in &restorables {
            restorable.notify_reconnected();
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
