//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors.
///
/// Validation errors carry the path of the offending key so operators can
/// find the problem without reading the whole file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read configuration file '{path}': {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// The document root must be a single mapping named `proxy`.
    #[error("config root must be a single mapping named `proxy`")]
    InvalidRoot,

    /// A required field is missing.
    #[error("{key}: {field} is required")]
    MissingField {
        /// Path of the enclosing key.
        key: String,
        /// Name of the missing field.
        field: String,
    },

    /// A field carries an invalid value.
    #[error("{key}: {message}")]
    InvalidValue {
        /// Path of the offending key.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// A backend weight is outside the allowed range.
    #[error("{key}: positive weight must be in range [1, 65535], got {weight}")]
    WeightOutOfRange {
        /// Path of the offending key.
        key: String,
        /// The rejected weight.
        weight: i32,
    },

    /// A route rule references a name that does not exist.
    #[error("{key}: `{name}` is not a known {kind}")]
    UnknownReference {
        /// Path of the offending key.
        key: String,
        /// The dangling name.
        name: String,
        /// What it was supposed to be (backend, backendGroup, route).
        kind: String,
    },

    /// A route was configured without any rules.
    #[error("{key}: route without any rules")]
    EmptyRoute {
        /// Path of the offending key.
        key: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
