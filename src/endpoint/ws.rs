//! WebSocket endpoints (`ws`, `wss`).
//!
//! Frontends answer HTTP upgrade requests on the configured path and speak
//! binary WebSocket afterwards; backends are dialed with an upgrade request
//! offering the `mqtt` subprotocol. Both sides are wrapped in
//! [`WsByteStream`] so the pump sees plain bytes.

use super::ws_stream::WsByteStream;
use super::{
    accept_loop, ClientEndpoint, ClientEndpointConfig, ClientHandler, Connection, EndpointAddress,
    EndpointError, EndpointFactory, EndpointResult, ProxyStream, ServerEndpoint,
    ServerEndpointConfig,
};
use crate::config::CertificateConfig;
use crate::tls;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{accept_hdr_async, client_async_tls_with_config, Connector};
use tracing::{debug, info, warn};

/// Upgrade handshake deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Subprotocols offered to clients. Paho's JS client expects
/// `Sec-WebSocket-Protocol: mqtt` back in the upgrade response.
const SUBPROTOCOLS: [&str; 2] = ["mqttv3.1", "mqtt"];

/// Factory for the `ws` and `wss` schemes.
pub(super) struct WsEndpointFactory;

impl EndpointFactory for WsEndpointFactory {
    fn create_server(
        &self,
        config: &ServerEndpointConfig,
    ) -> EndpointResult<Option<Arc<dyn ServerEndpoint>>> {
        let address = EndpointAddress::parse(&config.address, "ws")?;
        match address.scheme.as_str() {
            "ws" => {
                if config.certificate.is_some() || config.require_client_validation {
                    return Err(EndpointError::TlsOnlyForSecureSchemes);
                }
            }
            "wss" => {
                if config.certificate.is_none() {
                    return Err(EndpointError::MissingTlsForSecureScheme);
                }
            }
            _ => return Ok(None),
        }

        Ok(Some(Arc::new(WsServerEndpoint {
            address,
            certificate: config.certificate.clone(),
            require_client_validation: config.require_client_validation,
            ca_files: config.ca_files.clone(),
        })))
    }

    fn create_client(
        &self,
        config: &ClientEndpointConfig,
    ) -> EndpointResult<Option<Arc<dyn ClientEndpoint>>> {
        let address = EndpointAddress::parse(&config.address, "ws")?;
        match address.scheme.as_str() {
            "ws" => {
                if config.connection_certificate.is_some() {
                    return Err(EndpointError::TlsOnlyForSecureSchemes);
                }
            }
            "wss" => {}
            _ => return Ok(None),
        }
        if address.hostname() == "0.0.0.0" {
            return Err(EndpointError::InvalidClientHost);
        }

        Ok(Some(Arc::new(WsClientEndpoint {
            address,
            certificate: config.connection_certificate.clone(),
        })))
    }
}

/// Dials an upstream broker over a WebSocket upgrade.
struct WsClientEndpoint {
    address: EndpointAddress,
    certificate: Option<CertificateConfig>,
}

#[async_trait]
impl ClientEndpoint for WsClientEndpoint {
    fn is_secure(&self) -> bool {
        self.address.scheme == "wss"
    }

    fn scheme(&self) -> &str {
        &self.address.scheme
    }

    fn protocol(&self) -> &'static str {
        "ws"
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    async fn dial(&self) -> EndpointResult<Connection> {
        let mut request = self
            .address
            .to_string()
            .into_client_request()
            .map_err(|e| EndpointError::WebSocket(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        let connector = if self.is_secure() {
            Some(Connector::Rustls(tls::client_config(
                self.certificate.as_ref(),
            )?))
        } else {
            None
        };

        let addr = self.address.socket_addr()?;
        let stream = TcpStream::connect(&addr).await?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (ws, _response) = timeout(
            HANDSHAKE_TIMEOUT,
            client_async_tls_with_config(request, stream, None, connector),
        )
        .await
        .map_err(|_| EndpointError::HandshakeTimeout)?
        .map_err(|e| EndpointError::WebSocket(e.to_string()))?;

        debug!(backend = %addr, "WebSocket connection established");
        Ok(Connection::new(
            Box::new(WsByteStream::new(ws)),
            peer_addr,
        ))
    }
}

/// Listens for WebSocket upgrades, with TLS termination for `wss`.
struct WsServerEndpoint {
    address: EndpointAddress,
    certificate: Option<CertificateConfig>,
    require_client_validation: bool,
    ca_files: Vec<String>,
}

#[async_trait]
impl ServerEndpoint for WsServerEndpoint {
    fn is_secure(&self) -> bool {
        self.address.scheme == "wss"
    }

    fn scheme(&self) -> &str {
        &self.address.scheme
    }

    fn protocol(&self) -> &'static str {
        "ws"
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    async fn serve(
        &self,
        handler: ClientHandler,
        shutdown: broadcast::Receiver<()>,
    ) -> EndpointResult<()> {
        let acceptor = match &self.certificate {
            Some(certificate) => {
                let config = tls::server_config(
                    certificate,
                    self.require_client_validation,
                    &self.ca_files,
                )?;
                Some(TlsAcceptor::from(config))
            }
            None => None,
        };

        let bind_addr = self.address.socket_addr()?;
        let listener = TcpListener::bind(&bind_addr).await?;
        let name = self.address();
        let expected_path = self.address.dir_path();
        info!(listener = %name, "WebSocket listener started");

        accept_loop(listener, &name, shutdown, move |stream, peer_addr| {
            let _ = stream.set_nodelay(true);
            let handler = Arc::clone(&handler);
            let acceptor = acceptor.clone();
            let expected_path = expected_path.clone();
            tokio::spawn(async move {
                let stream: Box<dyn ProxyStream> = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => Box::new(tls_stream),
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => Box::new(stream),
                };

                let callback = move |request: &Request, response: Response| {
                    check_upgrade(&expected_path, peer_addr, request, response)
                };
                let ws = match timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback)).await
                {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        warn!(peer = %peer_addr, error = %e, "failed to upgrade to WebSocket");
                        return;
                    }
                    Err(_) => {
                        warn!(peer = %peer_addr, "WebSocket handshake timed out");
                        return;
                    }
                };

                handler(Connection::new(
                    Box::new(WsByteStream::new(ws)),
                    peer_addr,
                ))
                .await;
            });
        })
        .await
    }
}

/// Validate the upgrade request path and negotiate the subprotocol.
///
/// Any origin is accepted. The subprotocol picked is the first of
/// [`SUBPROTOCOLS`] the client offered.
fn check_upgrade(
    expected_path: &str,
    peer_addr: std::net::SocketAddr,
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let request_path = dir_path(request.uri().path());
    if request_path != expected_path {
        warn!(
            peer = %peer_addr,
            got = %request_path,
            expected = %expected_path,
            "ws request received for an invalid path"
        );
        let mut error = ErrorResponse::new(Some("Not Found".to_string()));
        *error.status_mut() = StatusCode::NOT_FOUND;
        return Err(error);
    }

    let offered = request
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let selected = SUBPROTOCOLS.iter().copied().find(|candidate| {
        offered
            .split(',')
            .any(|offer| offer.trim().eq_ignore_ascii_case(candidate))
    });
    if let Some(protocol) = selected {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    }

    Ok(response)
}

/// Normalise a path with a trailing slash for comparison.
fn dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    fn server(address: &str) -> ServerEndpointConfig {
        ServerEndpointConfig {
            address: address.to_string(),
            certificate: None,
            require_client_validation: false,
            ca_files: Vec::new(),
        }
    }

    #[test]
    fn test_client_endpoint_properties() {
        let endpoint = WsEndpointFactory
            .create_client(&ClientEndpointConfig {
                address: "ws://127.0.0.1:8080/mqtt".to_string(),
                connection_certificate: None,
            })
            .unwrap()
            .unwrap();
        assert!(!endpoint.is_secure());
        assert_eq!(endpoint.scheme(), "ws");
        assert_eq!(endpoint.protocol(), "ws");
        assert_eq!(endpoint.address(), "ws://127.0.0.1:8080/mqtt");
    }

    #[test]
    fn test_other_scheme_passed_over() {
        assert!(WsEndpointFactory
            .create_server(&server("mqtt://:1883"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_subprotocol_negotiation() {
        let request = Request::builder()
            .uri("ws://localhost/mqtt")
            .header("sec-websocket-protocol", "mqtt")
            .body(())
            .unwrap();
        let response = Response::builder().body(()).unwrap();
        let peer = "127.0.0.1:1".parse().unwrap();

        let accepted = check_upgrade("/mqtt/", peer, &request, response).unwrap();
        assert_eq!(
            accepted.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "mqtt"
        );
    }

    #[test]
    fn test_path_mismatch_is_404() {
        let request = Request::builder()
            .uri("ws://localhost/other")
            .body(())
            .unwrap();
        let response = Response::builder().body(()).unwrap();
        let peer = "127.0.0.1:1".parse().unwrap();

        let error = check_upgrade("/mqtt/", peer, &request, response).unwrap_err();
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_and_dial_round_trip() {
        let endpoint = WsEndpointFactory
            .create_server(&server("ws://127.0.0.1:19841/mqtt"))
            .unwrap()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

        let handler: ClientHandler = Arc::new(move |mut conn: Connection| {
            let seen_tx = seen_tx.clone();
            Box::pin(async move {
                let mut buf = [0u8; 2];
                conn.stream.read_exact(&mut buf).await.unwrap();
                conn.stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                let _ = seen_tx.send(buf.to_vec());
            })
        });

        let server_task = tokio::spawn(async move { endpoint.serve(handler, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A raw tungstenite client exercises the real upgrade path.
        let (mut ws, response) = connect_async("ws://127.0.0.1:19841/mqtt").await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        ws.send(Message::binary(vec![0xC0, 0x00])).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), Vec::from([0x20, 0x02, 0x00, 0x00]));

        let seen = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![0xC0, 0x00]);

        shutdown_tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let endpoint = WsEndpointFactory
            .create_server(&server("ws://127.0.0.1:19842/mqtt"))
            .unwrap()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handler: ClientHandler = Arc::new(|_conn| Box::pin(async {}));
        let server_task = tokio::spawn(async move { endpoint.serve(handler, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = connect_async("ws://127.0.0.1:19842/nope").await;
        assert!(result.is_err());

        shutdown_tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
    }
}
