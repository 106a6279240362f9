//! Frontends and the per-listener connected-client registry.

use crate::config::{optional_bool, FrontendConfig};
use crate::endpoint::{create_server_endpoint, ServerEndpoint, ServerEndpointConfig};
use crate::proxy::error::ProxyResult;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// A listening endpoint owned by a service.
pub struct Frontend {
    name: String,
    endpoint: Arc<dyn ServerEndpoint>,
}

impl Frontend {
    /// Build a frontend from configuration. Returns `None` when disabled.
    ///
    /// # Errors
    ///
    /// Returns an error when the endpoint configuration is invalid.
    pub fn from_config(config: &FrontendConfig) -> ProxyResult<Option<Self>> {
        let endpoint = create_server_endpoint(&ServerEndpointConfig {
            address: config.address.clone(),
            certificate: config.certificate.clone(),
            require_client_validation: config.require_client_validation,
            ca_files: config.ca_files.clone(),
        })?;

        if !optional_bool(config.enabled, true) {
            return Ok(None);
        }

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("frontend_{}", endpoint.address()));
        Ok(Some(Self { name, endpoint }))
    }

    /// Frontend name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol family label (`mqtt` or `ws`).
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.endpoint.protocol()
    }

    /// The listening endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<dyn ServerEndpoint> {
        &self.endpoint
    }
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("name", &self.name)
            .field("address", &self.endpoint.address())
            .finish_non_exhaustive()
    }
}

/// Per-listener registry of live client sessions.
///
/// Each session registers the sender of its stop channel. Draining the
/// registry signals every session, which unwinds both pump halves and drops
/// (closes) both sockets. After [`ClientRegistry::close`], `add` refuses.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    closed: bool,
    next_id: u64,
    clients: Vec<(u64, broadcast::Sender<()>)>,
}

impl ClientRegistry {
    /// Create an open, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns `None` once the registry is closed.
    pub fn add(&self, stop: broadcast::Sender<()>) -> Option<u64> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.closed {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.clients.push((id, stop));
        Some(id)
    }

    /// Deregister a finished session.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(index) = inner.clients.iter().position(|(i, _)| *i == id) {
            inner.clients.swap_remove(index);
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").clients.len()
    }

    /// True when no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark closed, signal every session, clear.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if !inner.closed {
            inner.closed = true;
            for (_, stop) in &inner.clients {
                let _ = stop.send(());
            }
        }
        inner.clients.clear();
    }
}
