//! Domain model for the registry and configuration surfaces.
//!
//! Statuses travel as strings on the wire; parsing is lenient so newer
//! servers can introduce values without breaking older clients.

use crate::error::{ClientError, Result};
use compass_proto as pb;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Serving traffic.
    Up,
    /// Administratively down.
    Down,
    /// Starting up, not yet serving.
    Starting,
    /// Temporarily pulled from rotation.
    OutOfService,
}

impl InstanceStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }

    /// Lenient parse; unrecognised values fall back to `Up`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "DOWN" => InstanceStatus::Down,
            "STARTING" => InstanceStatus::Starting,
            "OUT_OF_SERVICE" => InstanceStatus::OutOfService,
            _ => InstanceStatus::Up,
        }
    }
}

/// Health of a node as observed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthyStatus {
    /// Heartbeats arriving on time.
    Healthy,
    /// Heartbeats missed.
    Unhealthy,
    /// Not yet determined.
    Unknown,
}

impl HealthyStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthyStatus::Healthy => "HEALTHY",
            HealthyStatus::Unhealthy => "UNHEALTHY",
            HealthyStatus::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parse; unrecognised values fall back to `Unknown`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "HEALTHY" => HealthyStatus::Healthy,
            "UNHEALTHY" => HealthyStatus::Unhealthy,
            _ => HealthyStatus::Unknown,
        }
    }
}

/// A logical service within a namespace/group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Namespace the service lives in; empty uses the client default.
    pub namespace: String,
    /// Group within the namespace; empty uses the client default.
    pub group_name: String,
    /// Leaf name of the service.
    pub service_name: String,
    /// Free-form type tag, e.g. "HTTP".
    pub service_type: String,
    /// Service version string.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Fraction in [0, 1] of nodes protected from removal.
    pub protect_threshold: f64,
    /// Arbitrary key/value metadata.
    pub metadata: HashMap<String, String>,
    /// Arbitrary key/value tags.
    pub tags: HashMap<String, String>,
}

impl ServiceInfo {
    /// Create a service with the given leaf name.
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.protect_threshold) {
            return Err(ClientError::InvalidArgument(format!(
                "protect threshold {} out of [0, 1]",
                self.protect_threshold
            )));
        }
        Ok(())
    }

    pub(crate) fn to_proto(&self) -> pb::ServiceInfo {
        pb::ServiceInfo {
            namespace: self.namespace.clone(),
            group_name: self.group_name.clone(),
            service_name: self.service_name.clone(),
            service_type: self.service_type.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            protect_threshold: self.protect_threshold,
            metadata: self.metadata.clone(),
            tags: self.tags.clone(),
        }
    }

    pub(crate) fn from_proto(proto: pb::ServiceInfo) -> Self {
        Self {
            namespace: proto.namespace,
            group_name: proto.group_name,
            service_name: proto.service_name,
            service_type: proto.service_type,
            version: proto.version,
            description: proto.description,
            protect_threshold: proto.protect_threshold,
            metadata: proto.metadata,
            tags: proto.tags,
        }
    }
}

/// One running instance of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Server-assigned id. Empty until the first successful registration;
    /// immutable for the process lifetime afterwards.
    pub node_id: String,
    /// Namespace; empty uses the client default.
    pub namespace: String,
    /// Group; empty uses the client default.
    pub group_name: String,
    /// Owning service. Empty is filled from the service during
    /// `register_service`.
    pub service_name: String,
    /// Address the instance serves on.
    pub ip: String,
    /// Port in 1..=65535.
    pub port: u16,
    /// Load-balancing weight in 0.01..=10000.
    pub weight: f64,
    /// Ephemeral nodes are dropped by the server when heartbeats stop.
    pub ephemeral: bool,
    /// Lifecycle status.
    pub instance_status: InstanceStatus,
    /// Server-observed health.
    pub healthy_status: HealthyStatus,
    /// Arbitrary key/value metadata.
    pub metadata: HashMap<String, String>,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            namespace: String::new(),
            group_name: String::new(),
            service_name: String::new(),
            ip: String::new(),
            port: 0,
            weight: 100.0,
            ephemeral: true,
            instance_status: InstanceStatus::Up,
            healthy_status: HealthyStatus::Unknown,
            metadata: HashMap::new(),
        }
    }
}

impl NodeInfo {
    /// Create a node for the given address.
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set the owning service name.
    pub fn with_service(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }

    /// Set the load-balancing weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ip.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "node ip must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidArgument(
                "node port must be in 1..=65535".to_string(),
            ));
        }
        if !(0.01..=10_000.0).contains(&self.weight) {
            return Err(ClientError::InvalidArgument(format!(
                "node weight {} out of 0.01..=10000",
                self.weight
            )));
        }
        Ok(())
    }

    pub(crate) fn to_proto(&self) -> pb::NodeInfo {
        pb::NodeInfo {
            node_id: self.node_id.clone(),
            namespace: self.namespace.clone(),
            group_name: self.group_name.clone(),
            service_name: self.service_name.clone(),
            ip: self.ip.clone(),
            port: self.port as u32,
            weight: self.weight,
            ephemeral: if self.ephemeral { "Y" } else { "N" }.to_string(),
            instance_status: self.instance_status.as_str().to_string(),
            healthy_status: self.healthy_status.as_str().to_string(),
            metadata: self.metadata.clone(),
        }
    }

    pub(crate) fn from_proto(proto: pb::NodeInfo) -> Self {
        Self {
            node_id: proto.node_id,
            namespace: proto.namespace,
            group_name: proto.group_name,
            service_name: proto.service_name,
            ip: proto.ip,
            port: proto.port.min(u16::MAX as u32) as u16,
            weight: proto.weight,
            ephemeral: proto.ephemeral != "N",
            instance_status: InstanceStatus::from_wire(&proto.instance_status),
            healthy_status: HealthyStatus::from_wire(&proto.healthy_status),
            metadata: proto.metadata,
        }
    }
}

/// A configuration entry at a specific version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigInfo {
    /// Namespace; empty uses the client default.
    pub namespace: String,
    /// Group; empty uses the client default.
    pub group_name: String,
    /// Leaf identifier of the configuration.
    pub data_id: String,
    /// One of text/json/yaml/properties/xml; other values are stored
    /// opaquely.
    pub content_type: String,
    /// Opaque configuration body.
    pub content: String,
    /// Hex MD5 of the content, computed by the server.
    pub content_md5: String,
    /// Server-assigned, strictly increasing per config key.
    pub version: i64,
    /// Human-readable description.
    pub description: String,
    /// ADD, UPDATE or DELETE.
    pub change_type: String,
    /// Why the change was made.
    pub change_reason: String,
    /// Who made the change.
    pub changed_by: String,
}

impl ConfigInfo {
    /// Create a configuration entry for the given data id.
    pub fn new(data_id: &str, content: &str) -> Self {
        Self {
            data_id: data_id.to_string(),
            content: content.to_string(),
            content_type: "text".to_string(),
            ..Self::default()
        }
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.data_id.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "config data id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn to_proto(&self) -> pb::ConfigInfo {
        pb::ConfigInfo {
            namespace: self.namespace.clone(),
            group_name: self.group_name.clone(),
            data_id: self.data_id.clone(),
            content_type: self.content_type.clone(),
            content: self.content.clone(),
            content_md5: self.content_md5.clone(),
            version: self.version,
            description: self.description.clone(),
            change_type: self.change_type.clone(),
            change_reason: self.change_reason.clone(),
            changed_by: self.changed_by.clone(),
        }
    }

    pub(crate) fn from_proto(proto: pb::ConfigInfo) -> Self {
        Self {
            namespace: proto.namespace,
            group_name: proto.group_name,
            data_id: proto.data_id,
            content_type: proto.content_type,
            content: proto.content,
            content_md5: proto.content_md5,
            version: proto.version,
            description: proto.description,
            change_type: proto.change_type,
            change_reason: proto.change_reason,
            changed_by: proto.changed_by,
        }
    }
}

/// Immutable snapshot of a past configuration version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigHistoryInfo {
    /// Server-assigned history record id.
    pub history_id: i64,
    /// The configuration as it was.
    pub config: ConfigInfo,
    /// Change time, epoch milliseconds.
    pub change_time: i64,
}

impl ConfigHistoryInfo {
    pub(crate) fn from_proto(proto: pb::ConfigHistoryInfo) -> Self {
        Self {
            history_id: proto.history_id,
            config: proto.config.map(ConfigInfo::from_proto).unwrap_or_default(),
            change_time: proto.change_time,
        }
    }
}

/// Outcome of an operation as reported by the server.
///
/// A `success == false` status is a normal return value, not an error; the
/// transport delivered the response and the server declined the operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Whether the server accepted the operation.
    pub success: bool,
    /// Server-provided detail.
    pub message: String,
    /// Server-assigned code for failures.
    pub code: String,
}

impl OperationStatus {
    pub(crate) fn from_proto(proto: Option<pb::ResponseStatus>) -> Self {
        match proto {
            Some(status) => Self {
                success: status.success,
                message: status.message,
                code: status.code,
            },
            // A response without a status block is taken as acceptance.
            None => Self {
                success: true,
                message: String::new(),
                code: String::new(),
            },
        }
    }
}

/// Result of a registration that may have produced a node id.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// Server verdict.
    pub status: OperationStatus,
    /// Server-assigned node id, when a node was registered.
    pub node_id: Option<String>,
}

/// A service record with its current node list.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// Server verdict.
    pub status: OperationStatus,
    /// The service, when found.
    pub service: Option<ServiceInfo>,
    /// Current nodes of the service.
    pub nodes: Vec<NodeInfo>,
}

/// One-shot node listing.
#[derive(Debug, Clone)]
pub struct NodesSnapshot {
    /// Server verdict.
    pub status: OperationStatus,
    /// Matching nodes.
    pub nodes: Vec<NodeInfo>,
}

/// Result of a config save or rollback.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    /// Server verdict.
    pub status: OperationStatus,
    /// New version assigned by the server.
    pub version: i64,
    /// Server-computed hex MD5 of the stored content.
    pub content_md5: String,
}

/// Result of a config fetch.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Server verdict.
    pub status: OperationStatus,
    /// The configuration, when found.
    pub config: Option<ConfigInfo>,
}

/// Result of a config listing.
#[derive(Debug, Clone)]
pub struct ConfigListing {
    /// Server verdict.
    pub status: OperationStatus,
    /// Configurations in scope.
    pub configs: Vec<ConfigInfo>,
    /// Total configs in scope as reported by the server.
    pub total: u32,
}

/// Result of a config history query, reverse-chronological.
#[derive(Debug, Clone)]
pub struct HistoryListing {
    /// Server verdict.
    pub status: OperationStatus,
    /// History records, newest first.
    pub histories: Vec<ConfigHistoryInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_is_lenient() {
        assert_eq!(InstanceStatus::from_wire("DOWN"), InstanceStatus::Down);
        assert_eq!(InstanceStatus::from_wire("UP"), InstanceStatus::Up);
        assert_eq!(
            InstanceStatus::from_wire("SOMETHING_NEW"),
            InstanceStatus::Up
        );
        assert_eq!(HealthyStatus::from_wire("HEALTHY"), HealthyStatus::Healthy);
        assert_eq!(HealthyStatus::from_wire(""), HealthyStatus::Unknown);
        assert_eq!(
            HealthyStatus::from_wire("DEGRADED"),
            HealthyStatus::Unknown
        );
    }

    #[test]
    fn test_node_validation() {
        let node = NodeInfo::new("127.0.0.1", 8080);
        node.validate().unwrap();

        let node = NodeInfo::new("127.0.0.1", 0);
        assert!(node.validate().is_err());

        let node = NodeInfo::new("", 8080);
        assert!(node.validate().is_err());

        let node = NodeInfo::new("127.0.0.1", 8080).with_weight(0.0);
        assert!(node.validate().is_err());

        let node = NodeInfo::new("127.0.0.1", 8080).with_weight(20_000.0);
        assert!(node.validate().is_err());
    }

    #[test]
    fn test_node_proto_roundtrip_preserves_identity() {
        let mut node = NodeInfo::new("10.0.0.1", 9090).with_service("user-svc");
        node.node_id = "node-42".to_string();
        node.ephemeral = false;

        let wire = node.to_proto();
        assert_eq!(wire.ephemeral, "N");
        assert_eq!(wire.port, 9090);

        let back = NodeInfo::from_proto(wire);
        assert_eq!(back.node_id, "node-42");
        assert_eq!(back.port, 9090);
        assert!(!back.ephemeral);
        assert_eq!(back.service_name, "user-svc");
    }

    #[test]
    fn test_service_protect_threshold_bounds() {
        let mut service = ServiceInfo::new("user-svc");
        service.protect_threshold = 0.5;
        service.validate().unwrap();

        service.protect_threshold = 1.5;
        assert!(service.validate().is_err());
    }

    #[test]
    fn test_missing_response_status_is_success() {
        let status = OperationStatus::from_proto(None);
        assert!(status.success);
    }
}
