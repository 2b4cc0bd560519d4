//! Channel construction and credential attachment.
//!
//! Builds the tonic channel for a single endpoint or a round-robin cluster,
//! wires TLS material from the configured paths, and attaches the
//! `authorization` header through an interceptor so every stub shares the
//! same credentials.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use base64::Engine;
use compass_proto as pb;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

/// TCP connect timeout per endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel wrapped with the credential interceptor.
pub(crate) type AuthChannel = InterceptedService<Channel, AuthInterceptor>;

pub(crate) type RegistryClient = pb::registry_service_client::RegistryServiceClient<AuthChannel>;
pub(crate) type ConfigClient = pb::config_service_client::ConfigServiceClient<AuthChannel>;
pub(crate) type StreamClient = pb::stream_service_client::StreamServiceClient<AuthChannel>;

/// Attaches the `authorization` metadata to every outgoing request.
///
/// Basic credentials take precedence over a bearer token; with neither
/// configured no header is attached.
#[derive(Clone)]
pub(crate) struct AuthInterceptor {
    header: Option<MetadataValue<Ascii>>,
}

impl AuthInterceptor {
    pub(crate) fn from_config(config: &ClientConfig) -> Result<Self> {
        let raw = match (&config.user_id, &config.password, &config.auth_token) {
            (Some(user), Some(password), _) => Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password))
            )),
            (_, _, Some(token)) => Some(format!("Bearer {}", token)),
            _ => None,
        };
        let header = match raw {
            Some(value) => Some(MetadataValue::try_from(value.as_str()).map_err(|_| {
                ClientError::InvalidArgument(
                    "credentials contain characters not valid in a header".to_string(),
                )
            })?),
            None => None,
        };
        Ok(Self { header })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        if let Some(header) = &self.header {
            request.metadata_mut().insert("authorization", header.clone());
        }
        Ok(request)
    }
}

/// Build the channel described by the configuration. A comma-separated
/// address list yields a round-robin balanced channel.
pub(crate) async fn build_channel(config: &ClientConfig) -> Result<Channel> {
    let addresses = config.endpoints()?;
    let scheme = if config.enable_tls { "https" } else { "http" };
    let tls = if config.enable_tls {
        Some(build_tls(config)?)
    } else {
        None
    };

    let mut endpoints = Vec::with_capacity(addresses.len());
    for address in &addresses {
        let uri = format!("{}://{}", scheme, address);
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ClientError::InvalidArgument(format!("invalid endpoint {}: {}", uri, e)))?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(config.keep_alive_time)
            .keep_alive_timeout(config.keep_alive_timeout)
            .keep_alive_while_idle(config.keep_alive_without_calls)
            .tcp_nodelay(true);
        if let Some(tls) = &tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| ClientError::InvalidArgument(format!("TLS setup failed: {}", e)))?;
        }
        endpoints.push(endpoint);
    }

    if endpoints.len() == 1 {
        let channel = endpoints
            .remove(0)
            .connect()
            .await
            .map_err(|e| ClientError::TransportUnavailable(e.to_string()))?;
        debug!("Connected channel to {}", addresses[0]);
        Ok(channel)
    } else {
        info!("Balancing across {} endpoints", endpoints.len());
        Ok(Channel::balance_list(endpoints.into_iter()))
    }
}

fn build_tls(config: &ClientConfig) -> Result<ClientTlsConfig> {
    let mut tls = ClientTlsConfig::new();
    if let Some(ca_path) = &config.tls_ca_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            ClientError::InvalidArgument(format!(
                "failed to read CA certificate {}: {}",
                ca_path.display(),
                e
            ))
        })?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }
    if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
        let cert = std::fs::read(cert_path).map_err(|e| {
            ClientError::InvalidArgument(format!(
                "failed to read client certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let key = std::fs::read(key_path).map_err(|e| {
            ClientError::InvalidArgument(format!(
                "failed to read client key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }
    Ok(tls)
}

pub(crate) fn registry_stub(channel: Channel, auth: AuthInterceptor, max_inbound: usize) -> RegistryClient {
    pb::registry_service_client::RegistryServiceClient::with_interceptor(channel, auth)
        .max_decoding_message_size(max_inbound)
}

pub(crate) fn config_stub(channel: Channel, auth: AuthInterceptor, max_inbound: usize) -> ConfigClient {
    pb::config_service_client::ConfigServiceClient::with_interceptor(channel, auth)
        .max_decoding_message_size(max_inbound)
}

pub(crate) fn stream_stub(channel: Channel, auth: AuthInterceptor, max_inbound: usize) -> StreamClient {
    pb::stream_service_client::StreamServiceClient::with_interceptor(channel, auth)
        .max_decoding_message_size(max_inbound)
}
