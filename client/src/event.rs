//! Change events and listener capability records.
//!
//! Listeners are plain records of function slots: one required `on_change`
//! entry plus optional per-event-type slots. Routing invokes the specific
//! slot when one is present and falls back to `on_change` otherwise.

use crate::types::{ConfigInfo, NodeInfo};
use compass_proto as pb;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of a service-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEventType {
    /// A service was created.
    ServiceAdded,
    /// A service's definition changed.
    ServiceUpdated,
    /// A service was removed.
    ServiceDeleted,
    /// A node joined the service.
    NodeAdded,
    /// A node's properties or health changed.
    NodeUpdated,
    /// A node left the service.
    NodeRemoved,
}

impl ServiceEventType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEventType::ServiceAdded => "SERVICE_ADDED",
            ServiceEventType::ServiceUpdated => "SERVICE_UPDATED",
            ServiceEventType::ServiceDeleted => "SERVICE_DELETED",
            ServiceEventType::NodeAdded => "NODE_ADDED",
            ServiceEventType::NodeUpdated => "NODE_UPDATED",
            ServiceEventType::NodeRemoved => "NODE_REMOVED",
        }
    }

    /// Parse a wire tag. Unknown tags map to `ServiceUpdated` so newer
    /// servers can add event kinds without breaking older clients.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "SERVICE_ADDED" => ServiceEventType::ServiceAdded,
            "SERVICE_DELETED" => ServiceEventType::ServiceDeleted,
            "NODE_ADDED" => ServiceEventType::NodeAdded,
            "NODE_UPDATED" => ServiceEventType::NodeUpdated,
            "NODE_REMOVED" => ServiceEventType::NodeRemoved,
            _ => ServiceEventType::ServiceUpdated,
        }
    }
}

/// A change observed on a subscribed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceChangeEvent {
    /// What happened.
    pub event_type: ServiceEventType,
    /// Namespace of the affected service.
    pub namespace: String,
    /// Group of the affected service.
    pub group_name: String,
    /// Name of the affected service.
    pub service_name: String,
    /// The changed node, for node-scoped events.
    pub changed_node: Option<NodeInfo>,
    /// Full node list after the change.
    pub nodes: Vec<NodeInfo>,
    /// Event time, epoch milliseconds.
    pub event_time: i64,
}

impl ServiceChangeEvent {
    pub(crate) fn from_proto(proto: pb::ServiceChangeEvent) -> Self {
        Self {
            event_type: ServiceEventType::from_wire(&proto.event_type),
            namespace: proto.namespace,
            group_name: proto.group_name,
            service_name: proto.service_name,
            changed_node: proto.changed_node.map(NodeInfo::from_proto),
            nodes: proto.nodes.into_iter().map(NodeInfo::from_proto).collect(),
            event_time: proto.event_time,
        }
    }
}

/// Kind of a configuration-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigEventType {
    /// The configuration gained a new version.
    ConfigUpdated,
    /// The configuration head was deleted.
    ConfigDeleted,
}

impl ConfigEventType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEventType::ConfigUpdated => "CONFIG_UPDATED",
            ConfigEventType::ConfigDeleted => "CONFIG_DELETED",
        }
    }

    /// Parse a wire tag; unknown tags map to `ConfigUpdated`.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "CONFIG_DELETED" => ConfigEventType::ConfigDeleted,
            _ => ConfigEventType::ConfigUpdated,
        }
    }
}

/// A change observed on a watched configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    /// What happened.
    pub event_type: ConfigEventType,
    /// Namespace of the affected config.
    pub namespace: String,
    /// Group of the affected config.
    pub group_name: String,
    /// Data id of the affected config.
    pub data_id: String,
    /// Hex MD5 of the new content.
    pub content_md5: String,
    /// Full new configuration, for updates.
    pub config: Option<ConfigInfo>,
    /// Event time, epoch milliseconds.
    pub event_time: i64,
}

impl ConfigChangeEvent {
    pub(crate) fn from_proto(proto: pb::ConfigChangeEvent) -> Self {
        Self {
            event_type: ConfigEventType::from_wire(&proto.event_type),
            namespace: proto.namespace,
            group_name: proto.group_name,
            data_id: proto.data_id,
            content_md5: proto.content_md5,
            config: proto.config.map(ConfigInfo::from_proto),
            event_time: proto.event_time,
        }
    }
}

type Slot<E> = Arc<dyn Fn(&E) + Send + Sync>;
type ReconnectSlot = Arc<dyn Fn() + Send + Sync>;

/// Listener for service-change events.
///
/// Built from one required `on_change` handler; optional per-event slots
/// take precedence for their event type when set.
#[derive(Clone)]
pub struct ServiceListener {
    on_change: Slot<ServiceChangeEvent>,
    on_service_added: Option<Slot<ServiceChangeEvent>>,
    on_service_updated: Option<Slot<ServiceChangeEvent>>,
    on_service_deleted: Option<Slot<ServiceChangeEvent>>,
    on_node_added: Option<Slot<ServiceChangeEvent>>,
    on_node_updated: Option<Slot<ServiceChangeEvent>>,
    on_node_removed: Option<Slot<ServiceChangeEvent>>,
    on_reconnected: Option<ReconnectSlot>,
}

impl fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceListener").finish_non_exhaustive()
    }
}

impl ServiceListener {
    /// Create a listener with the required catch-all handler.
    pub fn new(on_change: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        Self {
            on_change: Arc::new(on_change),
            on_service_added: None,
            on_service_updated: None,
            on_service_deleted: None,
            on_node_added: None,
            on_node_updated: None,
            on_node_removed: None,
            on_reconnected: None,
        }
    }

    /// Handle `ServiceAdded` events specifically.
    pub fn on_service_added(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_service_added = Some(Arc::new(f));
        self
    }

    /// Handle `ServiceUpdated` events specifically.
    pub fn on_service_updated(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_service_updated = Some(Arc::new(f));
        self
    }

    /// Handle `ServiceDeleted` events specifically.
    pub fn on_service_deleted(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_service_deleted = Some(Arc::new(f));
        self
    }

    /// Handle `NodeAdded` events specifically.
    pub fn on_node_added(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_node_added = Some(Arc::new(f));
        self
    }

    /// Handle `NodeUpdated` events specifically.
    pub fn on_node_updated(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_node_updated = Some(Arc::new(f));
        self
    }

    /// Handle `NodeRemoved` events specifically.
    pub fn on_node_removed(mut self, f: impl Fn(&ServiceChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_node_removed = Some(Arc::new(f));
        self
    }

    /// Invoked after the session reconnects and this listener's
    /// subscription has been restored.
    pub fn on_reconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnected = Some(Arc::new(f));
        self
    }

    /// Route an event to the most specific available slot.
    pub(crate) fn invoke(&self, event: &ServiceChangeEvent) {
        let slot = match event.event_type {
            ServiceEventType::ServiceAdded => self.on_service_added.as_ref(),
            ServiceEventType::ServiceUpdated => self.on_service_updated.as_ref(),
            ServiceEventType::ServiceDeleted => self.on_service_deleted.as_ref(),
            ServiceEventType::NodeAdded => self.on_node_added.as_ref(),
            ServiceEventType::NodeUpdated => self.on_node_updated.as_ref(),
            ServiceEventType::NodeRemoved => self.on_node_removed.as_ref(),
        };
        match slot {
            Some(slot) => slot(event),
            None => (self.on_change)(event),
        }
    }

    pub(crate) fn invoke_reconnected(&self) {
        if let Some(slot) = &self.on_reconnected {
            slot();
        }
    }
}

/// Listener for configuration-change events.
#[derive(Clone)]
pub struct ConfigListener {
    on_change: Slot<ConfigChangeEvent>,
    on_updated: Option<Slot<ConfigChangeEvent>>,
    on_deleted: Option<Slot<ConfigChangeEvent>>,
    on_reconnected: Option<ReconnectSlot>,
}

impl fmt::Debug for ConfigListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigListener").finish_non_exhaustive()
    }
}

impl ConfigListener {
    /// Create a listener with the required catch-all handler.
    pub fn new(on_change: impl Fn(&ConfigChangeEvent) + Send + Sync + 'static) -> Self {
        Self {
            on_change: Arc::new(on_change),
            on_updated: None,
            on_deleted: None,
            on_reconnected: None,
        }
    }

    /// Handle `ConfigUpdated` events specifically.
    pub fn on_updated(mut self, f: impl Fn(&ConfigChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_updated = Some(Arc::new(f));
        self
    }

    /// Handle `ConfigDeleted` events specifically.
    pub fn on_deleted(mut self, f: impl Fn(&ConfigChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_deleted = Some(Arc::new(f));
        self
    }

    /// Invoked after the session reconnects and this listener's watch has
    /// been restored.
    pub fn on_reconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnected = Some(Arc::new(f));
        self
    }

    /// Route an event to the most specific available slot.
    pub(crate) fn invoke(&self, event: &ConfigChangeEvent) {
        let slot = match event.event_type {
            ConfigEventType::ConfigUpdated => self.on_updated.as_ref(),
            ConfigEventType::ConfigDeleted => self.on_deleted.as_ref(),
        };
        match slot {
            Some(slot) => slot(event),
            None => (self.on_change)(event),
        }
    }

    pub(crate) fn invoke_reconnected(&self) {
        if let Some(slot) = &self.on_reconnected {
            slot();
        }
    }
}
