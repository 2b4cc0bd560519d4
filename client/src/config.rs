//! Client configuration.
//!
//! A [`ClientConfig`] is built with the wither-style setters, optionally
//! overridden from the environment, and validated once before any wire I/O.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Group used when the caller supplies none.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// Default initial reconnect backoff in milliseconds.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
/// Default reconnect attempt limit. Negative values mean infinite.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: i32 = 10;
/// Default per-request deadline in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default maximum inbound message size in bytes.
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// How operations are carried to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeMode {
    /// Each operation is an independent request/response RPC; subscriptions
    /// use dedicated server-streaming RPCs.
    Unary,
    /// A single long-lived bidirectional stream carries all requests,
    /// responses and server pushes.
    Stream,
}

/// Configuration for a compass client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host:port`, or a comma-separated list of them. A list enables
    /// round-robin load balancing across the endpoints.
    pub server_address: String,
    /// Whether to use TLS for the channel.
    pub enable_tls: bool,
    /// Optional trust anchor for self-signed server certificates (PEM).
    pub tls_ca_path: Option<PathBuf>,
    /// Client certificate for mutual TLS (PEM). Requires `tls_key_path`.
    pub tls_cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS (PEM). Requires `tls_cert_path`.
    pub tls_key_path: Option<PathBuf>,
    /// Basic-auth user. Together with `password`, takes precedence over
    /// `auth_token`.
    pub user_id: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Bearer token, used when `user_id`/`password` are absent.
    pub auth_token: Option<String>,
    /// Default namespace applied when operations omit one.
    pub namespace: String,
    /// Default group applied when operations omit one. Empty or whitespace
    /// values normalise to [`DEFAULT_GROUP`].
    pub group_name: String,
    /// Carrier protocol for operations.
    pub exchange_mode: ExchangeMode,
    /// Interval between node heartbeats and stream-mode pings.
    pub heartbeat_interval: Duration,
    /// Initial reconnect backoff; doubles per failed attempt, capped at 30 s.
    pub reconnect_interval: Duration,
    /// Reconnect attempt limit. Negative means retry forever.
    pub max_reconnect_attempts: i32,
    /// Deadline attached to every request at call time.
    pub request_timeout: Duration,
    /// HTTP/2 keep-alive ping interval.
    pub keep_alive_time: Duration,
    /// HTTP/2 keep-alive ping timeout.
    pub keep_alive_timeout: Duration,
    /// Whether to send HTTP/2 keep-alive pings without active calls.
    pub keep_alive_without_calls: bool,
    /// Maximum inbound message size in bytes.
    pub max_inbound_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:12004".to_string(),
            enable_tls: false,
            tls_ca_path: None,
            tls_cert_path: None,
            tls_key_path: None,
            user_id: None,
            password: None,
            auth_token: None,
            namespace: "public".to_string(),
            group_name: DEFAULT_GROUP.to_string(),
            exchange_mode: ExchangeMode::Stream,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            keep_alive_time: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(20),
            keep_alive_without_calls: true,
            max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given `host:port` address or
    /// comma-separated cluster list.
    pub fn new(server_address: &str) -> Self {
        Self {
            server_address: server_address.to_string(),
            ..Self::default()
        }
    }

    /// Create a configuration from separate host and port.
    pub fn with_host_port(host: &str, port: u16) -> Self {
        Self::new(&format!("{}:{}", host, port))
    }

    /// Set the default namespace.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the default group. Empty values normalise to [`DEFAULT_GROUP`].
    pub fn with_group(mut self, group_name: &str) -> Self {
        self.group_name = normalize_group(group_name);
        self
    }

    /// Select the carrier protocol.
    pub fn with_exchange_mode(mut self, mode: ExchangeMode) -> Self {
        self.exchange_mode = mode;
        self
    }

    /// Use Basic authentication. Takes precedence over a bearer token.
    pub fn with_credentials(mut self, user_id: &str, password: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Use Bearer authentication.
    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    /// Enable TLS, optionally trusting a custom CA certificate.
    pub fn with_tls(mut self, ca_path: Option<PathBuf>) -> Self {
        self.enable_tls = true;
        self.tls_ca_path = ca_path;
        self
    }

    /// Enable mutual TLS with a client certificate and key.
    pub fn with_mutual_tls(mut self, cert_path: PathBuf, key_path: PathBuf) -> Self {
        self.enable_tls = true;
        self.tls_cert_path = Some(cert_path);
        self.tls_key_path = Some(key_path);
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the initial reconnect backoff.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the reconnect attempt limit. Negative means retry forever.
    pub fn with_max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Apply environment variable overrides (`COMPASS_SERVER_ADDRESS`,
    /// `COMPASS_NAMESPACE`, `COMPASS_GROUP`, `COMPASS_AUTH_TOKEN`).
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(addr) = std::env::var("COMPASS_SERVER_ADDRESS") {
            self.server_address = addr;
            info!("Server address overridden by environment: {}", self.server_address);
        }
        if let Ok(namespace) = std::env::var("COMPASS_NAMESPACE") {
            self.namespace = namespace;
            info!("Namespace overridden by environment: {}", self.namespace);
        }
        if let Ok(group) = std::env::var("COMPASS_GROUP") {
            self.group_name = normalize_group(&group);
            info!("Group overridden by environment: {}", self.group_name);
        }
        if let Ok(token) = std::env::var("COMPASS_AUTH_TOKEN") {
            self.auth_token = Some(token);
            info!("Auth token overridden by environment");
        }
    }

    /// Validate the configuration. Called once before any wire I/O.
    pub fn validate(&self) -> Result<()> {
        self.endpoints()?;
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::InvalidArgument(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(ClientError::InvalidArgument(
                "reconnect interval must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::InvalidArgument(
                "request timeout must be positive".to_string(),
            ));
        }
        if self.max_inbound_message_size == 0 {
            return Err(ClientError::InvalidArgument(
                "max inbound message size must be positive".to_string(),
            ));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(ClientError::InvalidArgument(
                "mutual TLS requires both certificate and key paths".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `server_address` into `host:port` endpoints. More than one
    /// endpoint enables round-robin load balancing.
    pub fn endpoints(&self) -> Result<Vec<String>> {
        let mut endpoints = Vec::new();
        for part in self.server_address.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (host, port) = part.rsplit_once(':').ok_or_else(|| {
                ClientError::InvalidArgument(format!(
                    "server address '{}' is missing a port",
                    part
                ))
            })?;
            if host.is_empty() {
                return Err(ClientError::InvalidArgument(format!(
                    "server address '{}' is missing a host",
                    part
                )));
            }
            let port: u32 = port.parse().map_err(|_| {
                ClientError::InvalidArgument(format!("invalid port in '{}'", part))
            })?;
            if port == 0 || port > 65_535 {
                return Err(ClientError::InvalidArgument(format!(
                    "port {} out of range in '{}'",
                    port, part
                )));
            }
            endpoints.push(part.to_string());
        }
        if endpoints.is_empty() {
            return Err(ClientError::InvalidArgument(
                "server address is empty".to_string(),
            ));
        }
        Ok(endpoints)
    }

    /// Default group applied to an operation that omitted one.
    pub(crate) fn group_or_default(&self, group: &str) -> String {
        let trimmed = group.trim();
        if trimmed.is_empty() {
            self.group_name.clone()
        } else {
            trimmed.to_string()
        }
    }

    /// Default namespace applied to an operation that omitted one.
    pub(crate) fn namespace_or_default(&self, namespace: &str) -> String {
        let trimmed = namespace.trim();
        if trimmed.is_empty() {
            self.namespace.clone()
        } else {
            trimmed.to_string()
        }
    }
}

/// Normalise a group name: empty or whitespace becomes [`DEFAULT_GROUP`].
pub fn normalize_group(group: &str) -> String {
    let trimmed = group.trim();
    if trimmed.is_empty() {
        DEFAULT_GROUP.to_string()
    } else {
        trimmed.to_string()
    }
}
