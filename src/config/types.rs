//! Serde model of the YAML configuration tree.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Smallest positive backend weight.
pub const MIN_WEIGHT: i32 = 1;
/// Largest positive backend weight.
pub const MAX_WEIGHT: i32 = 65_535;

/// Everything under the root `proxy` key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Logging front-end settings.
    pub logging: Option<LoggingConfig>,

    /// Prometheus exposition settings.
    pub metrics: Option<MetricsConfig>,

    /// Services by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub level: Option<String>,

    /// Verbosity above the configured level; values > 0 lower the floor.
    pub verbosity: Option<i32>,

    /// `""`, `"-"` and `"stdout"` write to stdout, `"stderr"` to stderr,
    /// anything else is a file path.
    #[serde(default)]
    pub output: String,

    /// Accepted for compatibility; the line format is fixed.
    #[serde(default)]
    pub template: String,
}

/// Prometheus exposition settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Listen address, default `http://:8080/metrics`.
    #[serde(default)]
    pub address: String,

    /// Disabled entirely when false.
    pub enabled: Option<bool>,

    /// Server certificate; required for `https`, forbidden for `http`.
    pub certificate: Option<CertificateConfig>,
}

/// A PEM certificate/key pair on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateConfig {
    /// Path to the PEM certificate chain.
    pub cert: String,
    /// Path to the PEM private key.
    pub key: String,
}

/// How a service forwards traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Copy bytes, segmented on MQTT packet boundaries.
    #[default]
    Raw,
    /// Decode and re-encode each packet.
    Packets,
}

/// One proxied service: a set of frontends bound to a set of backends.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Disabled services are skipped at startup.
    pub enabled: Option<bool>,

    /// Forwarding mode, default raw.
    #[serde(default, rename = "proxyMode")]
    pub proxy_mode: ProxyMode,

    /// Listening endpoints.
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,

    /// Upstream brokers.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Named weighted groups of backends, referenced from routes.
    #[serde(default, rename = "backendGroups")]
    pub backend_groups: BTreeMap<String, Vec<BackendRefConfig>>,

    /// Ordered CIDR routing rules; absent means every client uses the
    /// service backend list directly.
    #[serde(default)]
    pub routes: Vec<RouteRuleConfig>,

    /// Backend group used when no route rule matches.
    #[serde(rename = "defaultRoute")]
    pub default_route: Option<String>,

    /// Suppress synthetic per-scheme backend groups.
    #[serde(default, rename = "noDefaultGroup")]
    pub no_default_group: bool,
}

/// A listening endpoint of a service.
#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    /// Listen address, e.g. `mqtt://:1883` or `wss://:8443/mqtt`.
    pub address: String,

    /// Display name; defaults to `frontend_<address>`.
    pub name: Option<String>,

    /// Disabled frontends are skipped.
    pub enabled: Option<bool>,

    /// Server certificate; required for secure schemes, forbidden otherwise.
    pub certificate: Option<CertificateConfig>,

    /// Require and verify a client certificate.
    #[serde(default, rename = "requireClientValidation")]
    pub require_client_validation: bool,

    /// CA bundles used to verify client certificates.
    #[serde(default, rename = "caFiles")]
    pub ca_files: Vec<String>,
}

/// An upstream broker of a service.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Broker address, e.g. `mqtt://10.0.0.5:1883`.
    pub address: String,

    /// Display name; defaults to the address.
    pub name: Option<String>,

    /// Disabled backends are excluded entirely.
    pub enabled: Option<bool>,

    /// Selection weight. Positive values must stay within
    /// [`MIN_WEIGHT`]..=[`MAX_WEIGHT`]; zero or negative marks the backend
    /// passive.
    pub weight: Option<i32>,

    /// Client certificate presented when dialing `mqtts`/`wss` backends.
    #[serde(rename = "connectionCertificate")]
    pub connection_certificate: Option<CertificateConfig>,
}

/// A member of a named backend group, by backend name.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendRefConfig {
    /// Name of a backend declared in the same service.
    pub name: String,

    /// Weight override for this membership.
    pub weight: Option<i32>,
}

/// One CIDR routing rule. Exactly one of `backend` / `backend_group` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRuleConfig {
    /// Client source network, e.g. `10.0.0.0/8`; a bare IP matches exactly.
    #[serde(rename = "clientAddr")]
    pub client_addr: String,

    /// Target backend name.
    pub backend: Option<String>,

    /// Target backend group name.
    #[serde(rename = "backendGroup")]
    pub backend_group: Option<String>,
}

/// Resolve an optional bool with a default, mirroring the `enabled` keys.
#[must_use]
pub fn optional_bool(value: Option<bool>, default: bool) -> bool {
    value.unwrap_or(default)
}
