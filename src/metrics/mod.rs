//! Prometheus metrics sink.
//!
//! The proxy core reports four events: client connect, client disconnect,
//! request seen, response seen (with latency). Everything else — registry,
//! label families, exposition — lives behind [`ProxyMetrics`].

mod exporter;

pub use exporter::{ExporterHandle, MetricsExporter};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::{Registry, Unit};
use std::time::Duration;
use thiserror::Error;

/// Metrics subsystem errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The exposition address could not be parsed.
    #[error("invalid metrics address: {0}")]
    InvalidAddress(String),

    /// The exposition listener could not bind.
    #[error("failed to bind metrics listener: {0}")]
    Bind(String),

    /// TLS configuration for the exposition server failed.
    #[error(transparent)]
    Tls(#[from] crate::tls::TlsError),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Labels on the connected-clients gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    /// Service name.
    pub service: String,
    /// Frontend name.
    pub frontend: String,
    /// Frontend protocol (`mqtt` or `ws`).
    pub protocol: String,
}

/// Labels on the request counter and response histogram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Service name.
    pub service: String,
    /// Frontend name.
    pub frontend: String,
    /// Backend name.
    pub backend: String,
}

/// The proxy metric families.
///
/// - `mqproxy_connected_clients{service,frontend,protocol}` gauge
/// - `mqproxy_proxy_requests_total{service,frontend,backend}` counter
/// - `mqproxy_response_duration_seconds{service,frontend,backend}` histogram
pub struct ProxyMetrics {
    registry: Registry,
    connected_clients: Family<ConnectionLabels, Gauge>,
    requests: Family<RequestLabels, Counter>,
    response_duration: Family<RequestLabels, Histogram>,
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics").finish_non_exhaustive()
    }
}

impl ProxyMetrics {
    /// Create the registry and register all families.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connected_clients = Family::<ConnectionLabels, Gauge>::default();
        registry.register(
            "mqproxy_connected_clients",
            "Number of active connections to this proxy",
            connected_clients.clone(),
        );

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "mqproxy_proxy_requests",
            "Number of requests to mqproxy",
            requests.clone(),
        );

        let response_duration = Family::<RequestLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        });
        registry.register_with_unit(
            "mqproxy_response_duration",
            "Duration to answer a response",
            Unit::Seconds,
            response_duration.clone(),
        );

        Self {
            registry,
            connected_clients,
            requests,
            response_duration,
        }
    }

    /// A client connected to a frontend.
    pub fn on_client_connect(&self, service: &str, frontend: &str, protocol: &str) {
        self.connected_clients
            .get_or_create(&ConnectionLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                protocol: protocol.to_string(),
            })
            .inc();
    }

    /// The paired disconnect of [`Self::on_client_connect`].
    pub fn on_client_disconnect(&self, service: &str, frontend: &str, protocol: &str) {
        self.connected_clients
            .get_or_create(&ConnectionLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                protocol: protocol.to_string(),
            })
            .dec();
    }

    /// A request packet passed from client to backend.
    pub fn on_request(&self, service: &str, frontend: &str, backend: &str) {
        self.requests
            .get_or_create(&RequestLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                backend: backend.to_string(),
            })
            .inc();
    }

    /// A response packet passed from backend to client.
    pub fn on_response(&self, service: &str, frontend: &str, backend: &str, latency: Duration) {
        self.response_duration
            .get_or_create(&RequestLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                backend: backend.to_string(),
            })
            .observe(latency.as_secs_f64());
    }

    /// Current connected-client count for one label set, used by tests.
    #[must_use]
    pub fn connected_clients(&self, service: &str, frontend: &str, protocol: &str) -> i64 {
        self.connected_clients
            .get_or_create(&ConnectionLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                protocol: protocol.to_string(),
            })
            .get()
    }

    /// Current request count for one label set, used by tests.
    #[must_use]
    pub fn request_count(&self, service: &str, frontend: &str, backend: &str) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                service: service.to_string(),
                frontend: frontend.to_string(),
                backend: backend.to_string(),
            })
            .get()
    }

    /// Render the registry in Prometheus text exposition format.
    #[must_use]
    pub fn encode_text(&self) -> String {
        let mut output = String::new();
        // Encoding only fails on a failing fmt::Write, which String is not.
        let _ = encode(&mut output, &self.registry);
        output
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
