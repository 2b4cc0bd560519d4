//! Client error types.

use thiserror::Error;

/// Errors surfaced by the compass client.
///
/// Server-side failures reported inside a response payload are not errors;
/// they come back to the caller as an [`crate::types::OperationStatus`] with
/// `success == false`. This enum covers everything that prevents a response
/// from being obtained at all.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A required field was missing or a value was out of range. Raised
    /// before any wire I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a closed or never-connected client.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The server rejected the configured credentials.
    #[error("authentication rejected: {0}")]
    AuthFailure(String),

    /// Deadline exceeded on a unary call or a stream-mode request.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The underlying channel is down or the stream terminated.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The server pushed an error message over the stream.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Server-assigned error code.
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// The handshake did not complete within its deadline or was rejected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Unexpected local failure, e.g. a malformed response payload.
    #[error("local failure: {0}")]
    LocalFailure(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Transport status codes that indicate the session should be considered
/// disconnected (the reconnect engine takes over).
pub(crate) fn is_disconnect_code(code: tonic::Code) -> bool {
    matches!(
        code,
        tonic::Code::DeadlineExceeded
            | tonic::Code::Unavailable
            | tonic::Code::Unauthenticated
            | tonic::Code::Aborted
            | tonic::Code::Cancelled
    )
}

impl ClientError {
    /// Whether the error is a transient transport condition that the
    /// reconnect engine may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::TransportUnavailable(_)
        )
    }

    pub(crate) fn from_status(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::Unauthenticated => ClientError::AuthFailure(msg),
            tonic::Code::DeadlineExceeded => ClientError::Timeout(msg),
            tonic::Code::Unavailable | tonic::Code::Aborted | tonic::Code::Cancelled => {
                ClientError::TransportUnavailable(msg)
            }
            tonic::Code::InvalidArgument => ClientError::InvalidArgument(msg),
            code => ClientError::LocalFailure(format!("{}: {}", code, msg)),
        }
    }
}
