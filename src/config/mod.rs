//! Configuration loading and validation.
//!
//! The configuration file is a YAML mapping with a single root key `proxy`.
//! See [`ProxyConfig`] for the full tree.

mod error;
mod loader;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_file, load_str};
pub use types::{
    optional_bool, BackendConfig, BackendRefConfig, CertificateConfig, FrontendConfig,
    LoggingConfig, MetricsConfig, ProxyConfig, ProxyMode, RouteRuleConfig, ServiceConfig,
};
