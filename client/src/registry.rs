//! Registry manager: registration, heartbeats, discovery and
//! service-change subscriptions.

use crate::config::ExchangeMode;
use crate::dispatch::DispatchPool;
use crate::error::{ClientError, Result};
use crate::event::{ServiceChangeEvent, ServiceListener};
use crate::reconnect::Restorable;
use crate::session::{Session, SessionState};
use crate::stream::unexpected_payload;
use crate::types::{NodeInfo, OperationStatus, RegisterOutcome, NodesSnapshot, ServiceInfo, ServiceSnapshot};
use async_trait::async_trait;
use compass_proto as pb;
use dashmap::DashMap;
use pb::{client_message, server_message};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backoff ceiling for per-subscription retry loops in unary mode.
const SUBSCRIPTION_RETRY_CAP: Duration = Duration::from_secs(30);

/// A node this client registered, kept for identity-preserving
/// re-registration after reconnects.
struct NodeRecord {
    node: NodeInfo,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NodeRecord {
    fn abort_heartbeat(&self) {
        if let Ok(mut guard) = self.heartbeat.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    fn set_heartbeat(&self, handle: JoinHandle<()>) {
        if let Ok(mut guard) = self.heartbeat.lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }
}

struct SubscriptionRecord {
    id: String,
    namespace: String,
    group_name: String,
    /// Empty means the whole namespace/group.
    service_names: BTreeSet<String>,
    listener: ServiceListener,
    /// Ordered hand-off to the listener consumer; events for one
    /// subscription are delivered in arrival order.
    events: mpsc::UnboundedSender<ServiceChangeEvent>,
    /// Unary mode: the server-stream reader task.
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// One consumer task per subscription keeps per-subscription ordering and
/// isolates a slow listener from the dispatcher and other subscriptions.
fn spawn_listener_consumer(listener: ServiceListener) -> mpsc::UnboundedSender<ServiceChangeEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServiceChangeEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            crate::dispatch::run_listener(|| listener.invoke(&event));
        }
    });
    tx
}

impl SubscriptionRecord {
    fn matches(&self, event: &ServiceChangeEvent) -> bool {
        self.namespace == event.namespace
            && self.group_name == event.group_name
            && (self.service_names.is_empty() || self.service_names.contains(&event.service_name))
    }

    fn same_scope(&self, other: &SubscriptionRecord) -> bool {
        self.namespace == other.namespace
            && self.group_name == other.group_name
            && self.service_names == other.service_names
    }

    fn abort_task(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

struct RegistryInner {
    session: Session,
    pool: Arc<DispatchPool>,
    nodes: DashMap<String, NodeRecord>,
    subscriptions: DashMap<String, Arc<SubscriptionRecord>>,
    closed: AtomicBool,
}

/// Service registration and discovery. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RegistryManager {
    inner: Arc<RegistryInner>,
}

impl RegistryManager {
    pub(crate) fn new(session: Session, pool: Arc<DispatchPool>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                session,
                pool,
                nodes: DashMap::new(),
                subscriptions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register this manager's push sink with the session and start the
    /// event consumer. Called once at client construction.
    pub(crate) fn attach(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.session.set_service_event_sink(tx);
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.route_event(event);
            }
            debug!("Service event consumer exiting");
        });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState(
                "registry manager is closed".to_string(),
            ));
        }
        self.inner.session.ensure_operational()
    }

    /// Register a service, optionally registering one node atomically with
    /// it. Missing namespace/group are filled from the client defaults and
    /// a missing node service name from the service.
    pub async fn register_service(
        &self,
        service: ServiceInfo,
        node: Option<NodeInfo>,
    ) -> Result<RegisterOutcome> {
        self.ensure_open()?;
        let config = self.inner.session.config();

        let mut service = service;
        service.namespace = config.namespace_or_default(&service.namespace);
        service.group_name = config.group_or_default(&service.group_name);
        service.validate()?;

        let node = match node {
            Some(mut node) => {
                if node.service_name.trim().is_empty() {
                    node.service_name = service.service_name.clone();
                }
                node.namespace = config.namespace_or_default(&node.namespace);
                node.group_name = config.group_or_default(&node.group_name);
                node.validate()?;
                Some(node)
            }
            None => None,
        };

        let request = pb::RegisterServiceRequest {
            service: Some(service.to_proto()),
            node: node.as_ref().map(|n| n.to_proto()),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.register_service(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::RegisterService(request))
                .await?
            {
                server_message::Payload::RegisterService(resp) => resp,
                _ => return Err(unexpected_payload("RegisterService")),
            },
        };

        let status = OperationStatus::from_proto(response.status);
        let node_id = (!response.node_id.is_empty()).then(|| response.node_id.clone());
        if status.success {
            if let (Some(mut node), Some(id)) = (node, node_id.clone()) {
                node.node_id = id;
                self.track_node(node);
            }
        }
        Ok(RegisterOutcome { status, node_id })
    }

    /// Unregister one node of a service, or the whole service when no node
    /// id is given.
    pub async fn unregister_service(
        &self,
        namespace: &str,
        group_name: &str,
        service_name: &str,
        node_id: Option<&str>,
    ) -> Result<OperationStatus> {
        self.ensure_open()?;
        let config = self.inner.session.config();
        let namespace = config.namespace_or_default(namespace);
        let group_name = config.group_or_default(group_name);
        if service_name.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }

        // Drop local tracking before the wire call so a transport fault
        // cannot resurrect nodes the caller asked to remove.
        match node_id {
            Some(id) => {
                if let Some((_, record)) = self.inner.nodes.remove(id) {
                    record.abort_heartbeat();
                }
            }
            None => {
                let stale: Vec<String> = self
                    .inner
                    .nodes
                    .iter()
                    .filter(|entry| {
                        let node = &entry.value().node;
                        node.namespace == namespace
                            && node.group_name == group_name
                            && node.service_name == service_name
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in stale {
                    if let Some((_, record)) = self.inner.nodes.remove(&id) {
                        record.abort_heartbeat();
                    }
                }
            }
        }

        let request = pb::UnregisterServiceRequest {
            namespace,
            group_name,
            service_name: service_name.to_string(),
            node_id: node_id.unwrap_or_default().to_string(),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.unregister_service(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::UnregisterService(request))
                .await?
            {
                server_message::Payload::UnregisterService(resp) => resp,
                _ => return Err(unexpected_payload("UnregisterService")),
            },
        };
        Ok(OperationStatus::from_proto(response.status))
    }

    /// Register an additional node against an existing service.
    pub async fn register_node(&self, node: NodeInfo) -> Result<RegisterOutcome> {
        self.ensure_open()?;
        let config = self.inner.session.config();

        let mut node = node;
        node.namespace = config.namespace_or_default(&node.namespace);
        node.group_name = config.group_or_default(&node.group_name);
        if node.service_name.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "node service name must not be empty".to_string(),
            ));
        }
        node.validate()?;

        let request = pb::RegisterNodeRequest {
            node: Some(node.to_proto()),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.register_node(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::RegisterNode(request))
                .await?
            {
                server_message::Payload::RegisterNode(resp) => resp,
                _ => return Err(unexpected_payload("RegisterNode")),
            },
        };

        let status = OperationStatus::from_proto(response.status);
        let node_id = (!response.node_id.is_empty()).then(|| response.node_id.clone());
        if status.success {
            if let Some(id) = node_id.clone() {
                node.node_id = id;
                self.track_node(node);
            }
        }
        Ok(RegisterOutcome { status, node_id })
    }

    /// Unregister a node this client registered.
    pub async fn unregister_node(&self, node_id: &str) -> Result<OperationStatus> {
        self.ensure_open()?;
        let Some((_, record)) = self.inner.nodes.remove(node_id) else {
            return Err(ClientError::InvalidArgument(format!(
                "unknown node id {}",
                node_id
            )));
        };
        record.abort_heartbeat();
        self.send_unregister_node(&record.node).await
    }

    /// The service record plus its current node list.
    pub async fn get_service(
        &self,
        namespace: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<ServiceSnapshot> {
        self.ensure_open()?;
        let config = self.inner.session.config();
        if service_name.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }
        let request = pb::GetServiceRequest {
            namespace: config.namespace_or_default(namespace),
            group_name: config.group_or_default(group_name),
            service_name: service_name.to_string(),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.get_service(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::GetService(request))
                .await?
            {
                server_message::Payload::GetService(resp) => resp,
                _ => return Err(unexpected_payload("GetService")),
            },
        };
        Ok(ServiceSnapshot {
            status: OperationStatus::from_proto(response.status),
            service: response.service.map(ServiceInfo::from_proto),
            nodes: response
                .nodes
                .into_iter()
                .map(NodeInfo::from_proto)
                .collect(),
        })
    }

    /// One-shot node listing.
    pub async fn discover_nodes(
        &self,
        namespace: &str,
        group_name: &str,
        service_name: &str,
        healthy_only: bool,
    ) -> Result<NodesSnapshot> {
        self.ensure_open()?;
        let config = self.inner.session.config();
        if service_name.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }
        let request = pb::DiscoverNodesRequest {
            namespace: config.namespace_or_default(namespace),
            group_name: config.group_or_default(group_name),
            service_name: service_name.to_string(),
            healthy_only,
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.discover_nodes(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::DiscoverNodes(request))
                .await?
            {
                server_message::Payload::DiscoverNodes(resp) => resp,
                _ => return Err(unexpected_payload("DiscoverNodes")),
            },
        };
        Ok(NodesSnapshot {
            status: OperationStatus::from_proto(response.status),
            nodes: response
                .nodes
                .into_iter()
                .map(NodeInfo::from_proto)
                .collect(),
        })
    }

    /// Fire one heartbeat for a registered node. Diagnostics surface; the
    /// periodic task does this on its own.
    pub async fn send_heartbeat(&self, node_id: &str) -> Result<OperationStatus> {
        self.ensure_open()?;
        let node = self
            .inner
            .nodes
            .get(node_id)
            .map(|record| record.node.clone())
            .ok_or_else(|| {
                ClientError::InvalidArgument(format!("unknown node id {}", node_id))
            })?;
        heartbeat_once(&self.inner.session, &node).await
    }

    /// Subscribe to service-change events. An empty name list subscribes to
    /// every service in the namespace/group. Returns the subscription id.
    pub async fn subscribe(
        &self,
        namespace: &str,
        group_name: &str,
        service_names: Vec<String>,
        listener: ServiceListener,
    ) -> Result<String> {
        self.ensure_open()?;
        let config = self.inner.session.config();
        let id = Uuid::new_v4().to_string();
        let events = spawn_listener_consumer(listener.clone());
        let record = Arc::new(SubscriptionRecord {
            id: id.clone(),
            namespace: config.namespace_or_default(namespace),
            group_name: config.group_or_default(group_name),
            service_names: service_names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            listener,
            events,
            task: std::sync::Mutex::new(None),
        });
        self.inner.subscriptions.insert(id.clone(), record.clone());

        match self.inner.session.mode() {
            ExchangeMode::Stream => {
                if let Err(e) = self.send_subscribe(&id, &record).await {
                    self.inner.subscriptions.remove(&id);
                    return Err(e);
                }
            }
            ExchangeMode::Unary => {
                let handle = self.spawn_subscription_stream(id.clone(), record.clone());
                if let Ok(mut guard) = record.task.lock() {
                    *guard = Some(handle);
                }
            }
        }
        info!(
            "Subscription {} created for {}/{} ({} services)",
            id,
            record.namespace,
            record.group_name,
            if record.service_names.is_empty() {
                "all".to_string()
            } else {
                record.service_names.len().to_string()
            }
        );
        Ok(id)
    }

    /// Remove a subscription. Unknown ids succeed.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.ensure_open()?;
        match self.inner.subscriptions.remove(subscription_id) {
            Some((_, record)) => {
                record.abort_task();
                if self.inner.session.mode() == ExchangeMode::Stream {
                    // Best effort: the local record is gone either way.
                    let _ = self
                        .inner
                        .session
                        .send_async(client_message::Payload::Unsubscribe(
                            pb::UnsubscribeRequest {
                                subscription_id: subscription_id.to_string(),
                            },
                        ))
                        .await;
                }
                info!("Subscription {} removed", subscription_id);
            }
            None => debug!("unsubscribe on unknown id {} (no-op)", subscription_id),
        }
        Ok(())
    }

    /// Ids of the nodes this client currently has registered.
    pub fn registered_node_ids(&self) -> Vec<String> {
        self.inner
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Best-effort teardown in close order: unregister nodes, stop
    /// heartbeats, drop subscriptions. Never fails.
    pub(crate) async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes: Vec<NodeInfo> = self
            .inner
            .nodes
            .iter()
            .map(|entry| {
                // The node's heartbeat stops with it; a tick in flight after
                // the unregister would re-announce the node.
                entry.value().abort_heartbeat();
                entry.value().node.clone()
            })
            .collect();
        for node in &nodes {
            if self.inner.session.is_connected() {
                if let Err(e) = self.send_unregister_node(node).await {
                    warn!(
                        "Best-effort unregister of node {} failed: {}",
                        node.node_id, e
                    );
                }
            }
        }
        self.inner.nodes.clear();

        let subscriptions: Vec<Arc<SubscriptionRecord>> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for record in subscriptions {
            record.abort_task();
        }
        self.inner.subscriptions.clear();
        debug!("Registry manager shut down");
    }

    fn track_node(&self, node: NodeInfo) {
        let node_id = node.node_id.clone();
        info!(
            "Tracking node {} for service {}/{}/{}",
            node_id, node.namespace, node.group_name, node.service_name
        );
        let handle = self.spawn_heartbeat(node.clone());
        let record = NodeRecord {
            node,
            heartbeat: std::sync::Mutex::new(Some(handle)),
        };
        if let Some(old) = self.inner.nodes.insert(node_id, record) {
            old.abort_heartbeat();
        }
    }

    fn spawn_heartbeat(&self, node: NodeInfo) -> JoinHandle<()> {
        let session = self.inner.session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.config().heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if session.state() == SessionState::Closed {
                    break;
                }
                if !session.is_connected() {
                    debug!(
                        "Skipping heartbeat for node {} while disconnected",
                        node.node_id
                    );
                    continue;
                }
                match heartbeat_once(&session, &node).await {
                    Ok(status) => {
                        if !status.success {
                            debug!(
                                "Server declined heartbeat for node {}: {}",
                                node.node_id, status.message
                            );
                        }
                    }
                    Err(e) => match e {
                        ClientError::Timeout(_)
                        | ClientError::TransportUnavailable(_)
                        | ClientError::AuthFailure(_) => {
                            warn!(
                                "Heartbeat for node {} hit a transport fault: {}",
                                node.node_id, e
                            );
                            session.mark_disconnected(&format!("heartbeat failure: {}", e));
                        }
                        other => {
                            warn!("Heartbeat for node {} failed: {}", node.node_id, other);
                        }
                    },
                }
            }
            debug!("Heartbeat task for node {} exiting", node.node_id);
        })
    }

    async fn send_unregister_node(&self, node: &NodeInfo) -> Result<OperationStatus> {
        let request = pb::UnregisterNodeRequest {
            namespace: node.namespace.clone(),
            group_name: node.group_name.clone(),
            service_name: node.service_name.clone(),
            node_id: node.node_id.clone(),
        };
        let response = match self.inner.session.mode() {
            ExchangeMode::Unary => {
                let mut client = self.inner.session.registry_client().await?;
                self.inner
                    .session
                    .unary(client.unregister_node(self.inner.session.with_deadline(request)))
                    .await?
            }
            ExchangeMode::Stream => match self
                .inner
                .session
                .roundtrip(client_message::Payload::UnregisterNode(request))
                .await?
            {
                server_message::Payload::UnregisterNode(resp) => resp,
                _ => return Err(unexpected_payload("UnregisterNode")),
            },
        };
        Ok(OperationStatus::from_proto(response.status))
    }

    async fn send_subscribe(&self, id: &str, record: &SubscriptionRecord) -> Result<()> {
        let payload = if record.service_names.is_empty() {
            client_message::Payload::SubscribeNamespace(pb::SubscribeNamespaceRequest {
                subscription_id: id.to_string(),
                namespace: record.namespace.clone(),
                group_name: record.group_name.clone(),
            })
        } else {
            client_message::Payload::SubscribeServices(pb::SubscribeServicesRequest {
                subscription_id: id.to_string(),
                namespace: record.namespace.clone(),
                group_name: record.group_name.clone(),
                service_names: record.service_names.iter().cloned().collect(),
            })
        };
        self.inner.session.send_async(payload).await
    }

    /// Unary mode: dedicated server stream per subscription with its own
    /// retry loop.
    fn spawn_subscription_stream(
        &self,
        id: String,
        record: Arc<SubscriptionRecord>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let initial_backoff = manager.inner.session.config().reconnect_interval;
            let mut backoff = initial_backoff;
            loop {
                if manager.inner.closed.load(Ordering::SeqCst)
                    || !manager.inner.subscriptions.contains_key(&id)
                {
                    break;
                }
                match manager.inner.session.state() {
                    SessionState::Closed | SessionState::Failed => break,
                    _ => {}
                }
                if manager.has_duplicate(&id, &record) {
                    info!(
                        "Abandoning subscription {}: identical scope already active",
                        id
                    );
                    manager.inner.subscriptions.remove(&id);
                    break;
                }
                match manager.run_subscription_stream(&record).await {
                    Ok(()) => {
                        debug!("Subscription {} stream ended; re-establishing", id);
                        backoff = initial_backoff;
                    }
                    Err(e) => {
                        warn!(
                            "Subscription {} stream failed: {}; retry in {:?}",
                            id, e, backoff
                        );
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(SUBSCRIPTION_RETRY_CAP);
            }
            debug!("Subscription {} task exiting", id);
        })
    }

    async fn run_subscription_stream(&self, record: &SubscriptionRecord) -> Result<()> {
        let mut client = self.inner.session.registry_client().await?;
        // The subscription stream is long-lived; no per-call deadline.
        let mut stream = if record.service_names.is_empty() {
            client
                .subscribe_namespace(tonic::Request::new(pb::SubscribeNamespaceRequest {
                    subscription_id: record.id.clone(),
                    namespace: record.namespace.clone(),
                    group_name: record.group_name.clone(),
                }))
                .await
                .map_err(|s| self.inner.session.note_status(s))?
                .into_inner()
        } else {
            client
                .subscribe_services(tonic::Request::new(pb::SubscribeServicesRequest {
                    subscription_id: record.id.clone(),
                    namespace: record.namespace.clone(),
                    group_name: record.group_name.clone(),
                    service_names: record.service_names.iter().cloned().collect(),
                }))
                .await
                .map_err(|s| self.inner.session.note_status(s))?
                .into_inner()
        };
        self.inner.session.note_success();

        loop {
            match stream.message().await {
                Ok(Some(event)) => self.deliver(record, event),
                Ok(None) => return Ok(()),
                Err(status) => return Err(self.inner.session.note_status(status)),
            }
        }
    }

    fn deliver(&self, record: &SubscriptionRecord, proto: pb::ServiceChangeEvent) {
        let event = ServiceChangeEvent::from_proto(proto);
        if record.matches(&event) {
            let _ = record.events.send(event);
        }
    }

    /// Stream mode: fan a pushed event out to every matching subscription.
    fn route_event(&self, proto: pb::ServiceChangeEvent) {
        let event = ServiceChangeEvent::from_proto(proto);
        let sinks: Vec<mpsc::UnboundedSender<ServiceChangeEvent>> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.value().matches(&event))
            .map(|entry| entry.value().events.clone())
            .collect();
        for sink in sinks {
            let _ = sink.send(event.clone());
        }
    }

    fn has_duplicate(&self, id: &str, record: &SubscriptionRecord) -> bool {
        self.inner
            .subscriptions
            .iter()
            .any(|entry| entry.key() != id && entry.value().same_scope(record))
    }
}

async fn heartbeat_once(session: &Session, node: &NodeInfo) -> Result<OperationStatus> {
    // Full service context so a server that lost the node can rehydrate it
    // from this message alone.
    let request = pb::HeartbeatRequest {
        namespace: node.namespace.clone(),
        group_name: node.group_name.clone(),
        service_name: node.service_name.clone(),
        node_id: node.node_id.clone(),
        node: Some(node.to_proto()),
    };
    let response = match session.mode() {
        ExchangeMode::Unary => {
            let mut client = session.registry_client().await?;
            session
                .unary(client.heartbeat(session.with_deadline(request)))
                .await?
        }
        ExchangeMode::Stream => match session
            .roundtrip(client_message::Payload::Heartbeat(request))
            .await?
        {
            server_message::Payload::Heartbeat(resp) => resp,
            _ => return Err(unexpected_payload("Heartbeat")),
        },
    };
    Ok(OperationStatus::from_proto(response.status))
}

#[async_trait]
impl Restorable for RegistryManager {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn restore(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.session.mode() != ExchangeMode::Stream {
            // Unary mode: nodes are server-persistent and each subscription
            // loop re-dials on its own.
            return Ok(());
        }

        // Re-register every node with its preserved id.
        let nodes: Vec<NodeInfo> = self
            .inner
            .nodes
            .iter()
            .map(|entry| entry.value().node.clone())
            .collect();
        for node in nodes {
            if let Some(record) = self.inner.nodes.get(&node.node_id) {
                record.abort_heartbeat();
            }
            let request = pb::RegisterNodeRequest {
                node: Some(node.to_proto()),
            };
            match self
                .inner
                .session
                .roundtrip(client_message::Payload::RegisterNode(request))
                .await
            {
                Ok(server_message::Payload::RegisterNode(resp)) => {
                    let status = OperationStatus::from_proto(resp.status);
                    if status.success {
                        let handle = self.spawn_heartbeat(node.clone());
                        if let Some(record) = self.inner.nodes.get(&node.node_id) {
                            record.set_heartbeat(handle);
                        }
                        info!("Re-registered node {} after reconnect", node.node_id);
                    } else {
                        warn!(
                            "Server declined re-registration of node {}: {}",
                            node.node_id, status.message
                        );
                    }
                }
                Ok(_) => warn!(
                    "Unexpected payload re-registering node {}",
                    node.node_id
                ),
                Err(e) => warn!("Failed to re-register node {}: {}", node.node_id, e),
            }
        }

        // Resend every subscription with its existing id.
        let subscriptions: Vec<(String, Arc<SubscriptionRecord>)> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (id, record) in subscriptions {
            if self.has_duplicate(&id, &record) {
                debug!("Skipping restore of duplicate subscription {}", id);
                continue;
            }
            if let Err(e) = self.send_subscribe(&id, &record).await {
                warn!("Failed to restore subscription {}: {}", id, e);
            }
        }
        Ok(())
    }

    fn notify_reconnected(&self) {
        let listeners: Vec<ServiceListener> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().listener.clone())
            .collect();
        for listener in listeners {
            self.inner
                .pool
                .execute(Box::new(move || listener.invoke_reconnected()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::event::ServiceEventType;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> RegistryManager {
        let session = Session::new(ClientConfig::new("localhost:12004")).unwrap();
        RegistryManager::new(session, Arc::new(DispatchPool::with_workers(2)))
    }

    fn record(namespace: &str, names: &[&str]) -> Arc<SubscriptionRecord> {
        let (events, _) = mpsc::unbounded_channel();
        Arc::new(SubscriptionRecord {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            service_names: names.iter().map(|s| s.to_string()).collect(),
            listener: ServiceListener::new(|_| {}),
            events,
            task: std::sync::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let manager = manager();
        let err = manager
            .register_node(NodeInfo::new("127.0.0.1", 8080).with_service("user-svc"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_registered_node_ids_empty_initially() {
        let manager = manager();
        assert!(manager.registered_node_ids().is_empty());
    }

    #[test]
    fn test_subscription_matching() {
        let scoped = record("ns1", &["user-svc"]);
        let event = ServiceChangeEvent {
            event_type: ServiceEventType::NodeAdded,
            namespace: "ns1".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            service_name: "user-svc".to_string(),
            changed_node: None,
            nodes: Vec::new(),
            event_time: 0,
        };
        assert!(scoped.matches(&event));

        let other = ServiceChangeEvent {
            service_name: "other-svc".to_string(),
            ..event.clone()
        };
        assert!(!scoped.matches(&other));

        // Empty name set means the whole namespace/group.
        let whole = record("ns1", &[]);
        assert!(whole.matches(&other));
    }

    #[tokio::test]
    async fn test_duplicate_scope_detection() {
        let manager = manager();
        manager
            .inner
            .subscriptions
            .insert("a".to_string(), record("ns1", &["user-svc"]));
        manager
            .inner
            .subscriptions
            .insert("b".to_string(), record("ns1", &["user-svc"]));

        let probe = record("ns1", &["user-svc"]);
        assert!(manager.has_duplicate("b", &probe));
        assert!(manager.has_duplicate("c", &probe));

        let different = record("ns2", &["user-svc"]);
        assert!(!manager.has_duplicate("c", &different));
    }

    #[tokio::test]
    async fn test_route_event_reaches_matching_listener() {
        let manager = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let listener = ServiceListener::new(move |event| {
            assert_eq!(event.service_name, "user-svc");
            h.fetch_add(1, Ordering::SeqCst);
        });
        let events = spawn_listener_consumer(listener.clone());
        manager.inner.subscriptions.insert(
            "sub-1".to_string(),
            Arc::new(SubscriptionRecord {
                id: "sub-1".to_string(),
                namespace: "ns1".to_string(),
                group_name: "DEFAULT_GROUP".to_string(),
                service_names: ["user-svc".to_string()].into_iter().collect(),
                listener,
                events,
                task: std::sync::Mutex::new(None),
            }),
        );

        manager.route_event(pb::ServiceChangeEvent {
            event_type: "NODE_ADDED".to_string(),
            namespace: "ns1".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            service_name: "user-svc".to_string(),
            changed_node: None,
            nodes: vec![],
            event_time: 1,
        });
        // Non-matching namespace is filtered out.
        manager.route_event(pb::ServiceChangeEvent {
            event_type: "NODE_ADDED".to_string(),
            namespace: "ns2".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            service_name: "user-svc".to_string(),
            changed_node: None,
            nodes: vec![],
            event_time: 2,
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event should be delivered");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
