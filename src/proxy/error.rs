//! Proxy error types.

use thiserror::Error;

/// Errors from the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `Service::run` was called while the service was already running.
    #[error("service is already running")]
    AlreadyRunning,

    /// A service has no enabled frontend.
    #[error("service `{0}` has no enabled frontend")]
    NoEnabledFrontends(String),

    /// A service has no enabled backend.
    #[error("service `{0}` has no enabled backend")]
    NoEnabledBackends(String),

    /// A route rule carries an unparseable network.
    #[error("`{cidr}` is not a valid network: {message}")]
    InvalidCidr {
        /// The rejected network string.
        cidr: String,
        /// What is wrong with it.
        message: String,
    },

    /// A rule or group references an unknown backend.
    #[error("`{name}` is not a valid backend")]
    UnknownBackend {
        /// The dangling name.
        name: String,
    },

    /// A rule references an unknown backend group.
    #[error("`{name}` is not a valid backendGroup")]
    UnknownBackendGroup {
        /// The dangling name.
        name: String,
    },

    /// A rule references a group with no members.
    #[error("`{name}` is an empty group")]
    EmptyBackendGroup {
        /// The empty group name.
        name: String,
    },

    /// The raw pump buffer filled without a single decodable packet.
    #[error("message is too big")]
    MessageTooBig,

    /// Endpoint construction, listening or dialing failed.
    #[error(transparent)]
    Endpoint(#[from] crate::endpoint::EndpointError),

    /// MQTT framing failed.
    #[error(transparent)]
    Mqtt(#[from] crate::mqtt::MqttError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A spawned task failed to join.
    #[error("task failed: {0}")]
    Task(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
