//! Client facade: wires the session, managers and reconnect engine
//! together and owns the graceful shutdown order.

use crate::config::ClientConfig;
use crate::configuration::ConfigManager;
use crate::dispatch::DispatchPool;
use crate::error::Result;
use crate::reconnect::ReconnectEngine;
use crate::registry::RegistryManager;
use crate::session::{Session, SessionState, SessionStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Drain grace for the listener pool at close.
const POOL_DRAIN: Duration = Duration::from_secs(5);

/// The compass client: one authenticated session multiplexing the service
/// registry and the configuration store, kept alive across network faults.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CompassClient {
    session: Session,
    registry: RegistryManager,
    configuration: ConfigManager,
    pool: Arc<DispatchPool>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for CompassClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompassClient").finish_non_exhaustive()
    }
}

impl CompassClient {
    /// Build a client from the configuration. Environment overrides are
    /// applied, then the configuration is validated; nothing touches the
    /// network until [`connect`](Self::connect).
    ///
    /// Must be called within a tokio runtime: background consumers are
    /// spawned immediately.
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        config.apply_environment_overrides();
        let session = Session::new(config)?;
        let pool = Arc::new(DispatchPool::new());
        let registry = RegistryManager::new(session.clone(), pool.clone());
        let configuration = ConfigManager::new(session.clone(), pool.clone());

        // The engine holds restorables published by the managers; the
        // managers never learn about the engine.
        let engine = ReconnectEngine::new(session.clone());
        engine.add_restorable(Arc::new(registry.clone()));
        engine.add_restorable(Arc::new(configuration.clone()));
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        session.set_disconnect_listener(disconnect_tx);
        engine.start(disconnect_rx);

        registry.attach();
        configuration.attach();

        Ok(Self {
            session,
            registry,
            configuration,
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Establish the session. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        self.session.connect().await
    }

    /// Service registration and discovery.
    pub fn registry(&self) -> &RegistryManager {
        &self.registry
    }

    /// Distributed configuration access.
    pub fn configuration(&self) -> &ConfigManager {
        &self.configuration
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connected and not closed.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Transport liveness. No dedicated health RPC exists; this reports
    /// the session state.
    pub fn check_health(&self) -> bool {
        self.session.is_connected()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Most recent background or terminal error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.session.last_error()
    }

    /// Close the client. Idempotent and infallible. Shutdown order:
    /// best-effort node unregistration, heartbeat cancellation,
    /// subscription and watch teardown, transport close, pool drain.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing compass client");
        self.registry.shutdown().await;
        self.configuration.shutdown().await;
        self.session.close().await;
        self.pool.shutdown(POOL_DRAIN).await;
        info!("Compass client closed");
    }
}
