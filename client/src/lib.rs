//! Client runtime for the compass service-discovery and configuration
//! control plane.
//!
//! One authenticated gRPC session carries both the service registry and
//! the distributed configuration store, and keeps them alive across
//! network faults.
//!
//! ## Features
//!
//! - **Two carrier modes**: independent request/response RPCs, or a single
//!   multiplexed bidirectional stream for all traffic and server pushes
//! - **Registry**: service/node registration with automatic per-node
//!   heartbeats, discovery, and service-change subscriptions
//! - **Configuration**: save/get/delete/list, history and rollback, and
//!   config-change watches
//! - **Self-healing**: exponential-backoff reconnect that re-registers
//!   nodes under their original ids and replays every subscription and
//!   watch
//!
//! ## Example
//!
//! ```rust,no_run
//! use compass_client::{ClientConfig, CompassClient, NodeInfo, ServiceListener};
//!
//! # async fn example() -> compass_client::Result<()> {
//! let config = ClientConfig::new("localhost:12004")
//!     .with_namespace("ns1")
//!     .with_credentials("admin", "secret");
//! let client = CompassClient::new(config)?;
//! client.connect().await?;
//!
//! // Register a node; the server assigns its id.
//! let outcome = client
//!     .registry()
//!     .register_node(NodeInfo::new("127.0.0.1", 8080).with_service("user-svc"))
//!     .await?;
//! println!("registered as {:?}", outcome.node_id);
//!
//! // Watch the service for changes.
//! let subscription = client
//!     .registry()
//!     .subscribe(
//!         "ns1",
//!         "",
//!         vec!["user-svc".to_string()],
//!         ServiceListener::new(|event| {
//!             println!("{:?} on {}", event.event_type, event.service_name);
//!         }),
//!     )
//!     .await?;
//!
//! client.registry().unsubscribe(&subscription).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod configuration;
mod dispatch;
pub mod error;
pub mod event;
mod failure;
mod reconnect;
pub mod registry;
pub mod session;
mod stream;
mod transport;
pub mod types;

// Re-export main types
pub use client::CompassClient;
pub use config::{normalize_group, ClientConfig, ExchangeMode, DEFAULT_GROUP};
pub use configuration::ConfigManager;
pub use error::{ClientError, Result};
pub use event::{
    ConfigChangeEvent, ConfigEventType, ConfigListener, ServiceChangeEvent, ServiceEventType,
    ServiceListener,
};
pub use registry::RegistryManager;
pub use session::{Session, SessionState, SessionStats};
pub use types::{
    ConfigHistoryInfo, ConfigInfo, ConfigListing, ConfigSnapshot, HealthyStatus, HistoryListing,
    InstanceStatus, NodeInfo, NodesSnapshot, OperationStatus, RegisterOutcome, SaveOutcome,
    ServiceInfo, ServiceSnapshot,
};
