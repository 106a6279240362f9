//! TLS material loading and rustls configuration.

use crate::config::CertificateConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

/// TLS-related errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A certificate file could not be loaded.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoad {
        /// Path of the PEM file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A private key file could not be loaded.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoad {
        /// Path of the PEM file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A CA bundle could not be loaded or parsed.
    #[error("failed to load CA file '{path}': {message}")]
    CaLoad {
        /// Path of the PEM file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// Client validation was enabled without any CA files.
    #[error("client validation requires at least one entry in caFiles")]
    MissingClientCa,

    /// rustls rejected the assembled configuration.
    #[error("invalid TLS configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;

/// Load a certificate chain from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let loaded: Result<Vec<_>, _> = certs(&mut reader).collect();
    let chain = loaded.map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    if chain.is_empty() {
        return Err(TlsError::CertificateLoad {
            path: path.display().to_string(),
            message: "no certificates found in file".to_string(),
        });
    }
    Ok(chain)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: "no private key found in file".to_string(),
        })
}

/// Load the cert/key pair referenced by a [`CertificateConfig`].
pub fn load_key_pair(
    config: &CertificateConfig,
) -> TlsResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = load_certificates(Path::new(&config.cert))?;
    let key = load_private_key(Path::new(&config.key))?;
    debug!(cert = %config.cert, chain_len = chain.len(), "loaded certificate");
    Ok((chain, key))
}

/// Build a rustls server configuration for a secure frontend.
///
/// When `require_client_validation` is set, `ca_files` must name at least
/// one CA bundle; connecting clients must then present a certificate that
/// verifies against it.
///
/// # Errors
///
/// Returns an error if any PEM file fails to load or rustls rejects the
/// assembled configuration.
pub fn server_config(
    certificate: &CertificateConfig,
    require_client_validation: bool,
    ca_files: &[String],
) -> TlsResult<Arc<ServerConfig>> {
    let (chain, key) = load_key_pair(certificate)?;

    let builder = if require_client_validation {
        if ca_files.is_empty() {
            return Err(TlsError::MissingClientCa);
        }
        let mut roots = RootCertStore::empty();
        for ca in ca_files {
            for cert in load_certificates(Path::new(ca))? {
                roots.add(cert).map_err(|e| TlsError::CaLoad {
                    path: ca.clone(),
                    message: e.to_string(),
                })?;
            }
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::InvalidConfig(e.to_string()))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let config = builder
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::InvalidConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Build a rustls client configuration for dialing secure backends.
///
/// Server certificates are verified against the bundled web PKI roots; an
/// optional client certificate is presented when configured.
///
/// # Errors
///
/// Returns an error if the client certificate fails to load or rustls
/// rejects the configuration.
pub fn client_config(
    client_certificate: Option<&CertificateConfig>,
) -> TlsResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match client_certificate {
        Some(cert_config) => {
            let (chain, key) = load_key_pair(cert_config)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TlsError::InvalidConfig(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
