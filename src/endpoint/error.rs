//! Endpoint error types.

use thiserror::Error;

/// Errors from endpoint construction, listening and dialing.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// No registered factory recognises the address scheme.
    #[error("scheme is not supported: {0}")]
    UnsupportedScheme(String),

    /// The address string could not be parsed.
    #[error("`{address}` is not a valid address: {message}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// What is wrong with it.
        message: String,
    },

    /// TLS fields were given on an insecure scheme.
    #[error("certificate and client validation are only available for secure schemes")]
    TlsOnlyForSecureSchemes,

    /// A secure scheme is missing its certificate.
    #[error("missing TLS certificate for secure scheme")]
    MissingTlsForSecureScheme,

    /// `mqtt`/`mqtts` addresses cannot carry a path.
    #[error("{0} addresses can't contain a path")]
    PathNotAllowed(String),

    /// Client endpoints must name a concrete host.
    #[error("backend address requires a host; use 127.0.0.1 for loopback")]
    InvalidClientHost,

    /// TLS material or configuration failed.
    #[error(transparent)]
    Tls(#[from] crate::tls::TlsError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// WebSocket handshake failure.
    #[error("WebSocket handshake failed: {0}")]
    WebSocket(String),

    /// The WebSocket upgrade did not finish in time.
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
}

/// Result type for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;
