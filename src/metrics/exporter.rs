//! Prometheus HTTP exposition server.

use super::{MetricsError, MetricsResult, ProxyMetrics};
use crate::config::MetricsConfig;
use crate::endpoint::address::EndpointAddress;
use crate::tls;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Exposition address used when none is configured.
const DEFAULT_METRICS_ADDRESS: &str = "http://:8080/metrics";

/// Prometheus exposition server.
#[derive(Debug)]
pub struct MetricsExporter;

/// Handle for stopping a running exporter.
#[derive(Debug)]
pub struct ExporterHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ExporterHandle {
    /// Stop the exposition server.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl MetricsExporter {
    /// Start the exposition server if metrics are enabled.
    ///
    /// Returns `None` when `enabled: false`. `https` requires a certificate
    /// and `http` forbids one (enforced again here for callers that bypass
    /// config validation).
    ///
    /// # Errors
    ///
    /// Returns an error when the address is invalid, the certificate rules
    /// are violated, TLS setup fails, or the listener cannot bind.
    pub async fn start(
        config: Option<&MetricsConfig>,
        metrics: Arc<ProxyMetrics>,
    ) -> MetricsResult<Option<ExporterHandle>> {
        let default_config = MetricsConfig::default();
        let config = config.unwrap_or(&default_config);
        if !config.enabled.unwrap_or(true) {
            info!("metrics are disabled");
            return Ok(None);
        }

        let address = if config.address.is_empty() {
            DEFAULT_METRICS_ADDRESS
        } else {
            &config.address
        };
        let address = EndpointAddress::parse(address, "http")
            .map_err(|e| MetricsError::InvalidAddress(e.to_string()))?;

        let acceptor = match (address.scheme.as_str(), &config.certificate) {
            ("http", None) => None,
            ("http", Some(_)) => {
                return Err(MetricsError::InvalidAddress(
                    "certificate is not allowed for http".to_string(),
                ));
            }
            ("https", Some(certificate)) => {
                let tls_config = tls::server_config(certificate, false, &[])?;
                Some(TlsAcceptor::from(tls_config))
            }
            ("https", None) => {
                return Err(MetricsError::InvalidAddress(
                    "certificate is required for https".to_string(),
                ));
            }
            (other, _) => {
                return Err(MetricsError::InvalidAddress(format!(
                    "unsupported metrics scheme `{other}`"
                )));
            }
        };

        let bind_addr = address
            .socket_addr()
            .map_err(|e| MetricsError::InvalidAddress(e.to_string()))?;
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| MetricsError::Bind(format!("{bind_addr}: {e}")))?;
        info!(address = %bind_addr, "metrics listener started");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let metrics_path = address.dir_path();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, remote_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(error = %e, "metrics accept error");
                                continue;
                            }
                        };
                        debug!(remote = %remote_addr, "metrics connection");

                        let metrics = Arc::clone(&metrics);
                        let metrics_path = metrics_path.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |request| {
                                let metrics = Arc::clone(&metrics);
                                let metrics_path = metrics_path.clone();
                                async move { handle_request(&request, &metrics, &metrics_path) }
                            });

                            let served = match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        http1::Builder::new()
                                            .serve_connection(TokioIo::new(tls_stream), service)
                                            .await
                                    }
                                    Err(e) => {
                                        debug!(error = %e, "metrics TLS handshake failed");
                                        return;
                                    }
                                },
                                None => {
                                    http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .await
                                }
                            };
                            if let Err(e) = served {
                                debug!(error = %e, "metrics connection error");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("metrics listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Some(ExporterHandle { shutdown_tx }))
    }
}

/// Serve the metrics path; anything else is not found.
fn handle_request(
    request: &Request<Incoming>,
    metrics: &ProxyMetrics,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path();
    let normalized = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    };

    let response = if normalized == metrics_path {
        Response::builder()
            .status(StatusCode::OK)
            .header(
                "Content-Type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Full::new(Bytes::from(metrics.encode_text())))
            .expect("response build failed")
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("response build failed")
    };
    Ok(response)
}
