//! Protocol endpoints.
//!
//! An endpoint is the protocol-specific way to listen for clients or to dial
//! a backend. Four schemes exist: `mqtt` (plain TCP), `mqtts` (TCP + TLS),
//! `ws` (HTTP upgrade) and `wss` (HTTPS upgrade). Scheme handlers register
//! with a factory list; the first factory that recognises a scheme wins, so
//! new schemes slot in without touching the core.

pub mod address;
mod error;
mod mqtt;
mod ws;
mod ws_stream;

pub use address::EndpointAddress;
pub use error::{EndpointError, EndpointResult};
pub use ws_stream::WsByteStream;

use crate::config::CertificateConfig;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Longest backoff between accepts after temporary errors.
const MAX_TEMPORARY_NETWORK_DELAY: Duration = Duration::from_secs(1);

/// Object-safe byte stream, the common shape of every terminated connection.
pub trait ProxyStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> ProxyStream for T {}

/// A terminated connection: a byte stream plus the remote address.
pub struct Connection {
    /// The normalised byte stream.
    pub stream: Box<dyn ProxyStream>,
    /// Remote peer address.
    pub peer_addr: SocketAddr,
}

impl Connection {
    /// Wrap a stream with its peer address.
    #[must_use]
    pub fn new(stream: Box<dyn ProxyStream>, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Async callback invoked with every accepted client connection.
pub type ClientHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// The dialing side of an endpoint.
#[async_trait]
pub trait ClientEndpoint: Send + Sync {
    /// True when the transport is TLS.
    fn is_secure(&self) -> bool;

    /// The configured scheme (`mqtt`, `mqtts`, `ws`, `wss`).
    fn scheme(&self) -> &str;

    /// Protocol family (`mqtt` or `ws`), used as a metric label.
    fn protocol(&self) -> &'static str;

    /// Display address.
    fn address(&self) -> String;

    /// Connect to the endpoint target.
    async fn dial(&self) -> EndpointResult<Connection>;
}

/// The listening side of an endpoint.
#[async_trait]
pub trait ServerEndpoint: Send + Sync {
    /// True when the transport is TLS.
    fn is_secure(&self) -> bool;

    /// The configured scheme (`mqtt`, `mqtts`, `ws`, `wss`).
    fn scheme(&self) -> &str;

    /// Protocol family (`mqtt` or `ws`), used as a metric label.
    fn protocol(&self) -> &'static str;

    /// Display address.
    fn address(&self) -> String;

    /// Bind and accept clients until shutdown, invoking `handler` for each.
    ///
    /// Returns when the shutdown channel fires or the listener hits a fatal
    /// accept error.
    async fn serve(
        &self,
        handler: ClientHandler,
        shutdown: broadcast::Receiver<()>,
    ) -> EndpointResult<()>;
}

/// Configuration handed to server endpoint factories.
#[derive(Debug, Clone)]
pub struct ServerEndpointConfig {
    /// Listen address.
    pub address: String,
    /// Server certificate, secure schemes only.
    pub certificate: Option<CertificateConfig>,
    /// Require and verify client certificates.
    pub require_client_validation: bool,
    /// CA bundles for client verification.
    pub ca_files: Vec<String>,
}

/// Configuration handed to client endpoint factories.
#[derive(Debug, Clone)]
pub struct ClientEndpointConfig {
    /// Target address.
    pub address: String,
    /// Client certificate presented to secure backends.
    pub connection_certificate: Option<CertificateConfig>,
}

/// A scheme handler. Returning `Ok(None)` means "not my scheme, ask the
/// next factory".
trait EndpointFactory: Send + Sync {
    fn create_server(
        &self,
        config: &ServerEndpointConfig,
    ) -> EndpointResult<Option<Arc<dyn ServerEndpoint>>>;

    fn create_client(
        &self,
        config: &ClientEndpointConfig,
    ) -> EndpointResult<Option<Arc<dyn ClientEndpoint>>>;
}

/// Registered scheme handlers, in probing order.
static FACTORIES: [&(dyn EndpointFactory); 2] =
    [&mqtt::MqttEndpointFactory, &ws::WsEndpointFactory];

/// Create a server endpoint for the configured address.
///
/// # Errors
///
/// Returns `UnsupportedScheme` when no factory recognises the scheme, or the
/// factory's own error when the configuration is invalid for it.
pub fn create_server_endpoint(
    config: &ServerEndpointConfig,
) -> EndpointResult<Arc<dyn ServerEndpoint>> {
    for factory in FACTORIES {
        if let Some(endpoint) = factory.create_server(config)? {
            return Ok(endpoint);
        }
    }
    Err(EndpointError::UnsupportedScheme(config.address.clone()))
}

/// Create a client endpoint for the configured address.
///
/// # Errors
///
/// Returns `UnsupportedScheme` when no factory recognises the scheme, or the
/// factory's own error when the configuration is invalid for it.
pub fn create_client_endpoint(
    config: &ClientEndpointConfig,
) -> EndpointResult<Arc<dyn ClientEndpoint>> {
    for factory in FACTORIES {
        if let Some(endpoint) = factory.create_client(config)? {
            return Ok(endpoint);
        }
    }
    Err(EndpointError::UnsupportedScheme(config.address.clone()))
}

/// Accept errors that end the loop instead of being retried.
fn is_fatal_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound
    )
}

/// Shared accept loop with temporary-error backoff.
///
/// Temporary errors wait 5 ms, doubling per consecutive error, capped at
/// 1 s, reset on any successful accept. The shutdown channel is honoured
/// both while waiting for accepts and during a backoff sleep.
pub(crate) async fn accept_loop<F>(
    listener: TcpListener,
    name: &str,
    mut shutdown: broadcast::Receiver<()>,
    mut on_accept: F,
) -> EndpointResult<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    let mut backoff = Duration::ZERO;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(listener = name, "shutdown requested, closing listener");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    backoff = Duration::ZERO;
                    on_accept(stream, peer_addr);
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    error!(listener = name, error = %e, "accept returned an error; stopping accept loop");
                    return Err(e.into());
                }
                Err(e) => {
                    backoff = if backoff.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (backoff * 2).min(MAX_TEMPORARY_NETWORK_DELAY)
                    };
                    warn!(
                        listener = name,
                        error = %e,
                        delay_ms = backoff.as_millis() as u64,
                        "accept returned a temporary error; retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => {
                            debug!(listener = name, "shutdown requested during backoff");
                            return Ok(());
                        }
                        () = sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
