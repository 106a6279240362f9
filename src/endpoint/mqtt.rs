//! Plain and secure MQTT endpoints (`mqtt`, `mqtts`).

use super::{
    accept_loop, ClientEndpoint, ClientEndpointConfig, ClientHandler, Connection, EndpointAddress,
    EndpointError, EndpointFactory, EndpointResult, ServerEndpoint, ServerEndpointConfig,
};
use crate::config::CertificateConfig;
use crate::tls;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Factory for the `mqtt` and `mqtts` schemes.
pub(super) struct MqttEndpointFactory;

impl EndpointFactory for MqttEndpointFactory {
    fn create_server(
        &self,
        config: &ServerEndpointConfig,
    ) -> EndpointResult<Option<Arc<dyn ServerEndpoint>>> {
        let address = EndpointAddress::parse(&config.address, "mqtt")?;
        match address.scheme.as_str() {
            "mqtt" => {
                if config.certificate.is_some() || config.require_client_validation {
                    return Err(EndpointError::TlsOnlyForSecureSchemes);
                }
            }
            "mqtts" => {
                if config.certificate.is_none() {
                    return Err(EndpointError::MissingTlsForSecureScheme);
                }
            }
            _ => return Ok(None),
        }
        if !address.has_plain_path() {
            return Err(EndpointError::PathNotAllowed(address.scheme.clone()));
        }

        Ok(Some(Arc::new(MqttServerEndpoint {
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
        let address = EndpointAddress::parse(&config.address, "mqtt")?;
        match address.scheme.as_str() {
            "mqtt" => {
                if config.connection_certificate.is_some() {
                    return Err(EndpointError::TlsOnlyForSecureSchemes);
                }
            }
            "mqtts" => {}
            _ => return Ok(None),
        }
        if address.hostname() == "0.0.0.0" {
            return Err(EndpointError::InvalidClientHost);
        }
        if !address.has_plain_path() {
            return Err(EndpointError::PathNotAllowed(address.scheme.clone()));
        }

        Ok(Some(Arc::new(MqttClientEndpoint {
            address,
            certificate: config.connection_certificate.clone(),
        })))
    }
}

/// Dials an upstream broker over TCP, with TLS for `mqtts`.
struct MqttClientEndpoint {
    address: EndpointAddress,
    certificate: Option<CertificateConfig>,
}

#[async_trait]
impl ClientEndpoint for MqttClientEndpoint {
    fn is_secure(&self) -> bool {
        self.address.scheme == "mqtts"
    }

    fn scheme(&self) -> &str {
        &self.address.scheme
    }

    fn protocol(&self) -> &'static str {
        "mqtt"
    }

    fn address(&self) -> String {
        self.address.to_string()
    }

    async fn dial(&self) -> EndpointResult<Connection> {
        let addr = self.address.socket_addr()?;
        let stream = TcpStream::connect(&addr).await?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        if self.is_secure() {
            let config = tls::client_config(self.certificate.as_ref())?;
            let connector = TlsConnector::from(config);
            let server_name = ServerName::try_from(self.address.hostname().to_string())
                .map_err(|e| EndpointError::InvalidAddress {
                    address: self.address(),
                    message: e.to_string(),
                })?;
            let tls_stream = connector.connect(server_name, stream).await?;
            debug!(backend = %addr, "TLS connection established");
            Ok(Connection::new(Box::new(tls_stream), peer_addr))
        } else {
            Ok(Connection::new(Box::new(stream), peer_addr))
        }
    }
}

/// Listens for clients over TCP, with TLS termination for `mqtts`.
struct MqttServerEndpoint {
    address: EndpointAddress,
    certificate: Option<CertificateConfig>,
    require_client_validation: bool,
    ca_files: Vec<String>,
}

#[async_trait]
impl ServerEndpoint for MqttServerEndpoint {
    fn is_secure(&self) -> bool {
        self.address.scheme == "mqtts"
    }

    fn scheme(&self) -> &str {
        &self.address.scheme
    }

    fn protocol(&self) -> &'static str {
        "mqtt"
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
        info!(listener = %name, "MQTT listener started");

        accept_loop(listener, &name, shutdown, move |stream, peer_addr| {
            let _ = stream.set_nodelay(true);
            let handler = Arc::clone(&handler);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let connection = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => Connection::new(Box::new(tls_stream), peer_addr),
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                    None => Connection::new(Box::new(stream), peer_addr),
                };
                handler(connection).await;
            });
        })
        .await
    }
}
