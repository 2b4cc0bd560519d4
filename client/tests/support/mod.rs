//! In-process control-plane double for integration tests.
//!
//! Implements the registry, config and stream services against a shared
//! state table, so tests can drive the real client against real gRPC
//! traffic on a loopback port.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use compass_proto as pb;
use md5::{Digest, Md5};
use pb::config_service_server::{ConfigService, ConfigServiceServer};
use pb::registry_service_server::{RegistryService, RegistryServiceServer};
use pb::stream_service_server::{StreamService, StreamServiceServer};
use pb::{client_message, server_message};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Route client/server tracing through the test writer. `RUST_LOG` picks
/// the level.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn md5_hex(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn ok_status() -> pb::ResponseStatus {
    pb::ResponseStatus {
        success: true,
        message: String::new(),
        code: String::new(),
    }
}

fn failed_status(message: &str, code: &str) -> pb::ResponseStatus {
    pb::ResponseStatus {
        success: false,
        message: message.to_string(),
        code: code.to_string(),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

type ConfigKey = (String, String, String);

/// Shared state behind all three service implementations.
pub struct ServerState {
    services: Mutex<HashMap<ConfigKey, pb::ServiceInfo>>,
    nodes: Mutex<HashMap<String, pb::NodeInfo>>,
    configs: Mutex<HashMap<ConfigKey, pb::ConfigInfo>>,
    histories: Mutex<HashMap<ConfigKey, Vec<pb::ConfigHistoryInfo>>>,
    heartbeats: Mutex<HashMap<String, u64>>,
    next_node: AtomicU64,
    next_version: AtomicI64,
    next_history: AtomicI64,
    pub service_events: broadcast::Sender<pb::ServiceChangeEvent>,
    pub config_events: broadcast::Sender<pb::ConfigChangeEvent>,
}

impl ServerState {
    pub fn new() -> Arc<Self> {
        let (service_events, _) = broadcast::channel(64);
        let (config_events, _) = broadcast::channel(64);
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            next_node: AtomicU64::new(1),
            next_version: AtomicI64::new(1),
            next_history: AtomicI64::new(1),
            service_events,
            config_events,
        })
    }

    pub fn heartbeat_count(&self, node_id: &str) -> u64 {
        self.heartbeats
            .lock()
            .unwrap()
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    fn emit_service_event(&self, event_type: &str, node: &pb::NodeInfo) {
        let nodes: Vec<pb::NodeInfo> = self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| {
                n.namespace == node.namespace
                    && n.group_name == node.group_name
                    && n.service_name == node.service_name
            })
            .cloned()
            .collect();
        let _ = self.service_events.send(pb::ServiceChangeEvent {
            event_type: event_type.to_string(),
            namespace: node.namespace.clone(),
            group_name: node.group_name.clone(),
            service_name: node.service_name.clone(),
            changed_node: Some(node.clone()),
            nodes,
            event_time: now_ms(),
        });
    }

    fn register_service(&self, request: pb::RegisterServiceRequest) -> pb::RegisterServiceResponse {
        let Some(service) = request.service else {
            return pb::RegisterServiceResponse {
                status: Some(failed_status("service missing", "INVALID")),
                node_id: String::new(),
            };
        };
        let key = (
            service.namespace.clone(),
            service.group_name.clone(),
            service.service_name.clone(),
        );
        self.services.lock().unwrap().insert(key, service);

        let node_id = match request.node {
            Some(node) => self.store_node(node),
            None => String::new(),
        };
        pb::RegisterServiceResponse {
            status: Some(ok_status()),
            node_id,
        }
    }

    fn store_node(&self, mut node: pb::NodeInfo) -> String {
        // Honour a client-preserved id; assign one otherwise.
        if node.node_id.is_empty() {
            node.node_id = format!("node-{}", self.next_node.fetch_add(1, Ordering::SeqCst));
        }
        if node.healthy_status.is_empty() || node.healthy_status == "UNKNOWN" {
            node.healthy_status = "HEALTHY".to_string();
        }
        let id = node.node_id.clone();
        self.nodes.lock().unwrap().insert(id.clone(), node.clone());
        self.emit_service_event("NODE_ADDED", &node);
        id
    }

    fn register_node(&self, request: pb::RegisterNodeRequest) -> pb::RegisterNodeResponse {
        match request.node {
            Some(node) => pb::RegisterNodeResponse {
                status: Some(ok_status()),
                node_id: self.store_node(node),
            },
            None => pb::RegisterNodeResponse {
                status: Some(failed_status("node missing", "INVALID")),
                node_id: String::new(),
            },
        }
    }

    fn unregister_node(&self, request: pb::UnregisterNodeRequest) -> pb::UnregisterNodeResponse {
        let removed = self.nodes.lock().unwrap().remove(&request.node_id);
        if let Some(node) = removed {
            self.emit_service_event("NODE_REMOVED", &node);
        }
        pb::UnregisterNodeResponse {
            status: Some(ok_status()),
        }
    }

    fn unregister_service(
        &self,
        request: pb::UnregisterServiceRequest,
    ) -> pb::UnregisterServiceResponse {
        if request.node_id.is_empty() {
            let key = (
                request.namespace.clone(),
                request.group_name.clone(),
                request.service_name.clone(),
            );
            self.services.lock().unwrap().remove(&key);
            self.nodes.lock().unwrap().retain(|_, node| {
                !(node.namespace == request.namespace
                    && node.group_name == request.group_name
                    && node.service_name == request.service_name)
            });
        } else {
            self.nodes.lock().unwrap().remove(&request.node_id);
        }
        pb::UnregisterServiceResponse {
            status: Some(ok_status()),
        }
    }

    fn get_service(&self, request: pb::GetServiceRequest) -> pb::GetServiceResponse {
        let key = (
            request.namespace.clone(),
            request.group_name.clone(),
            request.service_name.clone(),
        );
        let service = self.services.lock().unwrap().get(&key).cloned();
        let nodes = self.matching_nodes(&request.namespace, &request.group_name, &request.service_name, false);
        match service {
            Some(service) => pb::GetServiceResponse {
                status: Some(ok_status()),
                service: Some(service),
                nodes,
            },
            None if !nodes.is_empty() => pb::GetServiceResponse {
                status: Some(ok_status()),
                service: None,
                nodes,
            },
            None => pb::GetServiceResponse {
                status: Some(failed_status("service not found", "NOT_FOUND")),
                service: None,
                nodes: vec![],
            },
        }
    }

    fn matching_nodes(
        &self,
        namespace: &str,
        group: &str,
        service: &str,
        healthy_only: bool,
    ) -> Vec<pb::NodeInfo> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|node| {
                node.namespace == namespace
                    && node.group_name == group
                    && node.service_name == service
                    && (!healthy_only || node.healthy_status != "UNHEALTHY")
            })
            .cloned()
            .collect()
    }

    fn discover_nodes(&self, request: pb::DiscoverNodesRequest) -> pb::DiscoverNodesResponse {
        pb::DiscoverNodesResponse {
            status: Some(ok_status()),
            nodes: self.matching_nodes(
                &request.namespace,
                &request.group_name,
                &request.service_name,
                request.healthy_only,
            ),
        }
    }

    fn heartbeat(&self, request: pb::HeartbeatRequest) -> pb::HeartbeatResponse {
        *self
            .heartbeats
            .lock()
            .unwrap()
            .entry(request.node_id.clone())
            .or_insert(0) += 1;
        // Rehydrate a node the server lost; the message carries the full
        // context for exactly this.
        if let Some(node) = request.node {
            self.nodes
                .lock()
                .unwrap()
                .entry(request.node_id)
                .or_insert(node);
        }
        pb::HeartbeatResponse {
            status: Some(ok_status()),
        }
    }

    fn save_config(&self, request: pb::SaveConfigRequest) -> pb::SaveConfigResponse {
        let Some(mut config) = request.config else {
            return pb::SaveConfigResponse {
                status: Some(failed_status("config missing", "INVALID")),
                version: 0,
                content_md5: String::new(),
            };
        };
        let key = (
            config.namespace.clone(),
            config.group_name.clone(),
            config.data_id.clone(),
        );
        let existed = self.configs.lock().unwrap().contains_key(&key);
        config.version = self.next_version.fetch_add(1, Ordering::SeqCst);
        config.content_md5 = md5_hex(&config.content);
        config.change_type = if existed { "UPDATE" } else { "ADD" }.to_string();

        self.configs.lock().unwrap().insert(key.clone(), config.clone());
        self.histories
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(pb::ConfigHistoryInfo {
                history_id: self.next_history.fetch_add(1, Ordering::SeqCst),
                config: Some(config.clone()),
                change_time: now_ms(),
            });

        let _ = self.config_events.send(pb::ConfigChangeEvent {
            event_type: "CONFIG_UPDATED".to_string(),
            namespace: config.namespace.clone(),
            group_name: config.group_name.clone(),
            data_id: config.data_id.clone(),
            content_md5: config.content_md5.clone(),
            config: Some(config.clone()),
            event_time: now_ms(),
        });

        pb::SaveConfigResponse {
            status: Some(ok_status()),
            version: config.version,
            content_md5: config.content_md5,
        }
    }

    fn get_config(&self, request: pb::GetConfigRequest) -> pb::GetConfigResponse {
        let key = (request.namespace, request.group_name, request.data_id);
        match self.configs.lock().unwrap().get(&key) {
            Some(config) => pb::GetConfigResponse {
                status: Some(ok_status()),
                config: Some(config.clone()),
            },
            None => pb::GetConfigResponse {
                status: Some(failed_status("config not found", "NOT_FOUND")),
                config: None,
            },
        }
    }

    fn delete_config(&self, request: pb::DeleteConfigRequest) -> pb::DeleteConfigResponse {
        let key = (
            request.namespace.clone(),
            request.group_name.clone(),
            request.data_id.clone(),
        );
        let removed = self.configs.lock().unwrap().remove(&key);
        match removed {
            Some(config) => {
                let _ = self.config_events.send(pb::ConfigChangeEvent {
                    event_type: "CONFIG_DELETED".to_string(),
                    namespace: config.namespace.clone(),
                    group_name: config.group_name.clone(),
                    data_id: config.data_id.clone(),
                    content_md5: config.content_md5.clone(),
                    config: None,
                    event_time: now_ms(),
                });
                pb::DeleteConfigResponse {
                    status: Some(ok_status()),
                }
            }
            None => pb::DeleteConfigResponse {
                status: Some(failed_status("config not found", "NOT_FOUND")),
            },
        }
    }

    fn list_configs(&self, request: pb::ListConfigsRequest) -> pb::ListConfigsResponse {
        let configs: Vec<pb::ConfigInfo> = self
            .configs
            .lock()
            .unwrap()
            .values()
            .filter(|config| {
                config.namespace == request.namespace && config.group_name == request.group_name
            })
            .cloned()
            .collect();
        let total = configs.len() as u32;
        pb::ListConfigsResponse {
            status: Some(ok_status()),
            configs,
            total,
        }
    }

    fn get_config_history(
        &self,
        request: pb::GetConfigHistoryRequest,
    ) -> pb::GetConfigHistoryResponse {
        let key = (request.namespace, request.group_name, request.data_id);
        let limit = if request.limit <= 0 { 100 } else { request.limit } as usize;
        let mut histories = self
            .histories
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        histories.reverse();
        histories.truncate(limit);
        pb::GetConfigHistoryResponse {
            status: Some(ok_status()),
            histories,
        }
    }

    fn rollback_config(&self, request: pb::RollbackConfigRequest) -> pb::RollbackConfigResponse {
        let key = (
            request.namespace.clone(),
            request.group_name.clone(),
            request.data_id.clone(),
        );
        let target = self
            .histories
            .lock()
            .unwrap()
            .get(&key)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| {
                        entry
                            .config
                            .as_ref()
                            .map(|c| c.version == request.target_version)
                            .unwrap_or(false)
                    })
                    .and_then(|entry| entry.config.clone())
            });
        let Some(mut config) = target else {
            return pb::RollbackConfigResponse {
                status: Some(failed_status("target version not found", "NOT_FOUND")),
                version: 0,
                content_md5: String::new(),
            };
        };
        config.changed_by = request.changed_by;
        config.change_reason = request.change_reason;
        let response = self.save_config(pb::SaveConfigRequest {
            config: Some(config),
        });
        pb::RollbackConfigResponse {
            status: response.status,
            version: response.version,
            content_md5: response.content_md5,
        }
    }
}

pub struct MockRegistry {
    state: Arc<ServerState>,
}

#[tonic::async_trait]
impl RegistryService for MockRegistry {
    async fn register_service(
        &self,
        request: Request<pb::RegisterServiceRequest>,
    ) -> Result<Response<pb::RegisterServiceResponse>, Status> {
        Ok(Response::new(self.state.register_service(request.into_inner())))
    }

    async fn unregister_service(
        &self,
        request: Request<pb::UnregisterServiceRequest>,
    ) -> Result<Response<pb::UnregisterServiceResponse>, Status> {
        Ok(Response::new(self.state.unregister_service(request.into_inner())))
    }

    async fn register_node(
        &self,
        request: Request<pb::RegisterNodeRequest>,
    ) -> Result<Response<pb::RegisterNodeResponse>, Status> {
        Ok(Response::new(self.state.register_node(request.into_inner())))
    }

    async fn unregister_node(
        &self,
        request: Request<pb::UnregisterNodeRequest>,
    ) -> Result<Response<pb::UnregisterNodeResponse>, Status> {
        Ok(Response::new(self.state.unregister_node(request.into_inner())))
    }

    async fn get_service(
        &self,
        request: Request<pb::GetServiceRequest>,
    ) -> Result<Response<pb::GetServiceResponse>, Status> {
        Ok(Response::new(self.state.get_service(request.into_inner())))
    }

    async fn discover_nodes(
        &self,
        request: Request<pb::DiscoverNodesRequest>,
    ) -> Result<Response<pb::DiscoverNodesResponse>, Status> {
        Ok(Response::new(self.state.discover_nodes(request.into_inner())))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        Ok(Response::new(self.state.heartbeat(request.into_inner())))
    }

    type SubscribeServicesStream = ReceiverStream<Result<pb::ServiceChangeEvent, Status>>;

    async fn subscribe_services(
        &self,
        request: Request<pb::SubscribeServicesRequest>,
    ) -> Result<Response<Self::SubscribeServicesStream>, Status> {
        let request = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let mut events = self.state.service_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let matches = event.namespace == request.namespace
                    && event.group_name == request.group_name
                    && (request.service_names.is_empty()
                        || request.service_names.contains(&event.service_name));
                if matches && tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type SubscribeNamespaceStream = ReceiverStream<Result<pb::ServiceChangeEvent, Status>>;

    async fn subscribe_namespace(
        &self,
        request: Request<pb::SubscribeNamespaceRequest>,
    ) -> Result<Response<Self::SubscribeNamespaceStream>, Status> {
        let request = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let mut events = self.state.service_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let matches = event.namespace == request.namespace
                    && event.group_name == request.group_name;
                if matches && tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct MockConfig {
    state: Arc<ServerState>,
}

#[tonic::async_trait]
impl ConfigService for MockConfig {
    async fn save_config(
        &self,
        request: Request<pb::SaveConfigRequest>,
    ) -> Result<Response<pb::SaveConfigResponse>, Status> {
        Ok(Response::new(self.state.save_config(request.into_inner())))
    }

    async fn get_config(
        &self,
        request: Request<pb::GetConfigRequest>,
    ) -> Result<Response<pb::GetConfigResponse>, Status> {
        Ok(Response::new(self.state.get_config(request.into_inner())))
    }

    async fn delete_config(
        &self,
        request: Request<pb::DeleteConfigRequest>,
    ) -> Result<Response<pb::DeleteConfigResponse>, Status> {
        Ok(Response::new(self.state.delete_config(request.into_inner())))
    }

    async fn list_configs(
        &self,
        request: Request<pb::ListConfigsRequest>,
    ) -> Result<Response<pb::ListConfigsResponse>, Status> {
        Ok(Response::new(self.state.list_configs(request.into_inner())))
    }

    async fn get_config_history(
        &self,
        request: Request<pb::GetConfigHistoryRequest>,
    ) -> Result<Response<pb::GetConfigHistoryResponse>, Status> {
        Ok(Response::new(
            self.state.get_config_history(request.into_inner()),
        ))
    }

    async fn rollback_config(
        &self,
        request: Request<pb::RollbackConfigRequest>,
    ) -> Result<Response<pb::RollbackConfigResponse>, Status> {
        Ok(Response::new(self.state.rollback_config(request.into_inner())))
    }

    type WatchConfigStream = ReceiverStream<Result<pb::ConfigChangeEvent, Status>>;

    async fn watch_config(
        &self,
        request: Request<pb::WatchConfigRequest>,
    ) -> Result<Response<Self::WatchConfigStream>, Status> {
        let request = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let mut events = self.state.config_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let matches = event.namespace == request.namespace
                    && event.group_name == request.group_name
                    && request.data_ids.contains(&event.data_id);
                if matches && tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[derive(Default)]
struct StreamFilters {
    subscriptions: Vec<pb::SubscribeServicesRequest>,
    namespaces: Vec<pb::SubscribeNamespaceRequest>,
    watches: Vec<pb::WatchConfigRequest>,
}

impl StreamFilters {
    fn service_match(&self, event: &pb::ServiceChangeEvent) -> bool {
        self.subscriptions.iter().any(|sub| {
            sub.namespace == event.namespace
                && sub.group_name == event.group_name
                && (sub.service_names.is_empty()
                    || sub.service_names.contains(&event.service_name))
        }) || self.namespaces.iter().any(|sub| {
            sub.namespace == event.namespace && sub.group_name == event.group_name
        })
    }

    fn config_match(&self, event: &pb::ConfigChangeEvent) -> bool {
        self.watches.iter().any(|watch| {
            watch.namespace == event.namespace
                && watch.group_name == event.group_name
                && watch.data_ids.contains(&event.data_id)
        })
    }
}

pub struct MockStream {
    state: Arc<ServerState>,
}

#[tonic::async_trait]
impl StreamService for MockStream {
    type ConnectStream = ReceiverStream<Result<pb::ServerMessage, Status>>;

    async fn connect(
        &self,
        request: Request<tonic::Streaming<pb::ClientMessage>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<pb::ServerMessage, Status>>(64);
        let state = self.state.clone();
        let filters = Arc::new(Mutex::new(StreamFilters::default()));

        // Push forwarders: server-initiated messages carry no request id.
        let push_tx = tx.clone();
        let push_filters = filters.clone();
        let mut service_events = state.service_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = service_events.recv().await {
                let matched = push_filters.lock().unwrap().service_match(&event);
                if matched {
                    let message = pb::ServerMessage {
                        request_id: String::new(),
                        payload: Some(server_message::Payload::ServiceChange(event)),
                    };
                    if push_tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
            }
        });
        let push_tx = tx.clone();
        let push_filters = filters.clone();
        let mut config_events = state.config_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = config_events.recv().await {
                let matched = push_filters.lock().unwrap().config_match(&event);
                if matched {
                    let message = pb::ServerMessage {
                        request_id: String::new(),
                        payload: Some(server_message::Payload::ConfigChange(event)),
                    };
                    if push_tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Ok(Some(message)) = inbound.message().await {
                let request_id = message.request_id.clone();
                let Some(payload) = message.payload else { continue };
                let reply = match payload {
                    client_message::Payload::Handshake(_) => {
                        Some(server_message::Payload::HandshakeAck(pb::HandshakeAck {
                            connection_id: Uuid::new_v4().to_string(),
                        }))
                    }
                    client_message::Payload::Ping(ping) => {
                        Some(server_message::Payload::Pong(pb::Pong {
                            client_time: ping.client_time,
                            server_time: now_ms(),
                        }))
                    }
                    client_message::Payload::RegisterService(req) => Some(
                        server_message::Payload::RegisterService(state.register_service(req)),
                    ),
                    client_message::Payload::UnregisterService(req) => Some(
                        server_message::Payload::UnregisterService(state.unregister_service(req)),
                    ),
                    client_message::Payload::RegisterNode(req) => Some(
                        server_message::Payload::RegisterNode(state.register_node(req)),
                    ),
                    client_message::Payload::UnregisterNode(req) => Some(
                        server_message::Payload::UnregisterNode(state.unregister_node(req)),
                    ),
                    client_message::Payload::GetService(req) => {
                        Some(server_message::Payload::GetService(state.get_service(req)))
                    }
                    client_message::Payload::DiscoverNodes(req) => Some(
                        server_message::Payload::DiscoverNodes(state.discover_nodes(req)),
                    ),
                    client_message::Payload::Heartbeat(req) => {
                        Some(server_message::Payload::Heartbeat(state.heartbeat(req)))
                    }
                    client_message::Payload::SubscribeServices(req) => {
                        filters.lock().unwrap().subscriptions.push(req);
                        Some(server_message::Payload::Ack(ok_status()))
                    }
                    client_message::Payload::SubscribeNamespace(req) => {
                        filters.lock().unwrap().namespaces.push(req);
                        Some(server_message::Payload::Ack(ok_status()))
                    }
                    client_message::Payload::Unsubscribe(req) => {
                        let mut filters = filters.lock().unwrap();
                        filters
                            .subscriptions
                            .retain(|sub| sub.subscription_id != req.subscription_id);
                        filters
                            .namespaces
                            .retain(|sub| sub.subscription_id != req.subscription_id);
                        Some(server_message::Payload::Ack(ok_status()))
                    }
                    client_message::Payload::SaveConfig(req) => {
                        Some(server_message::Payload::SaveConfig(state.save_config(req)))
                    }
                    client_message::Payload::GetConfig(req) => {
                        Some(server_message::Payload::GetConfig(state.get_config(req)))
                    }
                    client_message::Payload::DeleteConfig(req) => Some(
                        server_message::Payload::DeleteConfig(state.delete_config(req)),
                    ),
                    client_message::Payload::ListConfigs(req) => Some(
                        server_message::Payload::ListConfigs(state.list_configs(req)),
                    ),
                    client_message::Payload::GetConfigHistory(req) => Some(
                        server_message::Payload::GetConfigHistory(state.get_config_history(req)),
                    ),
                    client_message::Payload::RollbackConfig(req) => Some(
                        server_message::Payload::RollbackConfig(state.rollback_config(req)),
                    ),
                    client_message::Payload::WatchConfig(req) => {
                        filters.lock().unwrap().watches.push(req);
                        Some(server_message::Payload::Ack(ok_status()))
                    }
                    client_message::Payload::Unwatch(req) => {
                        filters
                            .lock()
                            .unwrap()
                            .watches
                            .retain(|watch| watch.watch_id != req.watch_id);
                        Some(server_message::Payload::Ack(ok_status()))
                    }
                };
                if let Some(payload) = reply {
                    let message = pb::ServerMessage {
                        request_id,
                        payload: Some(payload),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// A running control-plane double bound to a loopback port.
pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Start on an ephemeral port.
    pub async fn start(state: Arc<ServerState>) -> MockServer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, state).await
    }

    /// Start on a specific address; used to simulate a server restart.
    pub async fn start_on(addr: SocketAddr, state: Arc<ServerState>) -> MockServer {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        Self::serve(listener, state).await
    }

    async fn serve(listener: tokio::net::TcpListener, state: Arc<ServerState>) -> MockServer {
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = oneshot::channel::<()>();
        let registry = MockRegistry { state: state.clone() };
        let config = MockConfig { state: state.clone() };
        let stream = MockStream { state: state.clone() };
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistryServiceServer::new(registry))
                .add_service(ConfigServiceServer::new(config))
                .add_service(StreamServiceServer::new(stream))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await
                .ok();
        });
        MockServer {
            addr,
            state,
            shutdown,
            handle,
        }
    }

    /// Stop the server, dropping every live connection. Long-lived streams
    /// block graceful shutdown, so the serve task is aborted after a short
    /// grace.
    pub async fn stop(self) -> SocketAddr {
        let addr = self.addr;
        let _ = self.shutdown.send(());
        let mut handle = self.handle;
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            let _ = handle.await;
        }
        addr
    }
}
