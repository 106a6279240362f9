//! A service: a set of frontends bound to a set of backends.

use super::backend::{select_backend, Backend};
use super::error::{ProxyError, ProxyResult};
use super::frontend::{ClientRegistry, Frontend};
use super::pump::{run_pump, Direction, PumpContext, RequestClock};
use super::route::{with_synthetic_groups, CidrNet, Route, RouteRule, RouteTarget};
use crate::config::{optional_bool, ProxyMode, ServiceConfig};
use crate::endpoint::{create_client_endpoint, ClientEndpointConfig, ClientHandler, Connection};
use crate::metrics::ProxyMetrics;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const STATUS_STOPPED: u32 = 0;
const STATUS_RUNNING: u32 = 1;

/// One proxied service.
pub struct Service {
    name: String,
    frontends: Vec<Arc<Frontend>>,
    backends: Vec<Arc<Backend>>,
    route: Option<Route>,
    proxy_mode: ProxyMode,
    status: AtomicU32,
    metrics: Arc<ProxyMetrics>,
}

impl Service {
    /// Build a service from configuration. Returns `None` when disabled.
    ///
    /// Disabled frontends and backends are excluded; a service left with
    /// zero of either fails to construct.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid endpoints, dangling group or route
    /// references, and services with nothing enabled.
    pub fn from_config(
        name: &str,
        config: &ServiceConfig,
        metrics: Arc<ProxyMetrics>,
    ) -> ProxyResult<Option<Arc<Self>>> {
        if !optional_bool(config.enabled, true) {
            return Ok(None);
        }

        let mut frontends = Vec::with_capacity(config.frontends.len());
        for frontend_config in &config.frontends {
            if let Some(frontend) = Frontend::from_config(frontend_config)? {
                frontends.push(Arc::new(frontend));
            }
        }
        if frontends.is_empty() {
            return Err(ProxyError::NoEnabledFrontends(name.to_string()));
        }

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend_config in &config.backends {
            if !optional_bool(backend_config.enabled, true) {
                continue;
            }
            let endpoint = create_client_endpoint(&ClientEndpointConfig {
                address: backend_config.address.clone(),
                connection_certificate: backend_config.connection_certificate.clone(),
            })?;
            let backend_name = backend_config
                .name
                .clone()
                .unwrap_or_else(|| backend_config.address.clone());
            backends.push(Arc::new(Backend::new(
                backend_name,
                backend_config.weight.unwrap_or(1),
                endpoint,
            )));
        }
        if backends.is_empty() {
            return Err(ProxyError::NoEnabledBackends(name.to_string()));
        }

        let route = build_route(config, &backends)?;

        Ok(Some(Arc::new(Self {
            name: name.to_string(),
            frontends,
            backends,
            route,
            proxy_mode: config.proxy_mode,
            status: AtomicU32::new(STATUS_STOPPED),
            metrics,
        })))
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The enabled backends.
    #[must_use]
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Run every frontend listener until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` for a concurrent second start, or the first
    /// listener error; a failing listener stops the whole service.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> ProxyResult<()> {
        if self
            .status
            .compare_exchange(
                STATUS_STOPPED,
                STATUS_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ProxyError::AlreadyRunning);
        }
        info!(service = %self.name, "service starting");

        // A service-local channel lets one failing listener stop its
        // siblings without tearing other services down.
        let (local_tx, _) = broadcast::channel::<()>(4);
        let mut global_rx = shutdown.subscribe();
        let forward_tx = local_tx.clone();
        let forwarder = tokio::spawn(async move {
            let _ = global_rx.recv().await;
            let _ = forward_tx.send(());
        });

        let mut listeners = JoinSet::new();
        for frontend in &self.frontends {
            let service = Arc::clone(&self);
            let frontend = Arc::clone(frontend);
            let registry = Arc::new(ClientRegistry::new());
            let shutdown_rx = local_tx.subscribe();

            listeners.spawn(async move {
                let handler = service.clone().client_handler(&frontend, &registry);
                let result = frontend.endpoint().serve(handler, shutdown_rx).await;
                // Listener gone; drain whatever clients it still owns.
                registry.close();
                result
            });
        }

        let mut result: ProxyResult<()> = Ok(());
        while let Some(joined) = listeners.join_next().await {
            let listener_result = match joined {
                Ok(r) => r.map_err(ProxyError::from),
                Err(e) => Err(ProxyError::Task(e.to_string())),
            };
            if let Err(e) = listener_result {
                error!(service = %self.name, error = %e, "frontend listener failed");
                if result.is_ok() {
                    result = Err(e);
                }
                let _ = local_tx.send(());
            }
        }

        forwarder.abort();
        self.status.store(STATUS_STOPPED, Ordering::Release);
        info!(service = %self.name, "service stopped");
        result
    }

    /// The per-connection callback handed to a frontend endpoint.
    fn client_handler(
        self: Arc<Self>,
        frontend: &Arc<Frontend>,
        registry: &Arc<ClientRegistry>,
    ) -> ClientHandler {
        let frontend = Arc::clone(frontend);
        let registry = Arc::clone(registry);
        Arc::new(move |connection: Connection| {
            let service = Arc::clone(&self);
            let frontend = Arc::clone(&frontend);
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                // Both halves subscribe before registration so a drain
                // signal can never slip between add and subscribe.
                let (stop_tx, stop_rx_up) = broadcast::channel::<()>(4);
                let stop_rx_down = stop_tx.subscribe();
                let Some(client_id) = registry.add(stop_tx.clone()) else {
                    // Listener already drained; drop the connection.
                    return;
                };
                service
                    .handle_client(&frontend, connection, stop_tx, stop_rx_up, stop_rx_down)
                    .await;
                registry.remove(client_id);
            })
        })
    }

    /// Serve one client: pick a backend, dial it, pump both directions.
    async fn handle_client(
        &self,
        frontend: &Frontend,
        connection: Connection,
        stop: broadcast::Sender<()>,
        stop_rx_up: broadcast::Receiver<()>,
        stop_rx_down: broadcast::Receiver<()>,
    ) {
        let protocol = frontend.protocol();
        self.metrics
            .on_client_connect(&self.name, frontend.name(), protocol);
        let _disconnect = DisconnectGuard {
            metrics: &self.metrics,
            service: &self.name,
            frontend: frontend.name(),
            protocol,
        };

        let peer_addr = connection.peer_addr;
        debug!(
            service = %self.name,
            frontend = frontend.name(),
            client = %peer_addr,
            "client connected"
        );

        let candidates: &[Arc<Backend>] = match &self.route {
            Some(route) => match route.resolve(peer_addr.ip()) {
                Some(target) => target.candidates(),
                None => {
                    warn!(
                        service = %self.name,
                        client = %peer_addr,
                        "no route accepts the client"
                    );
                    return;
                }
            },
            None => &self.backends,
        };

        let mut tried: Vec<Arc<Backend>> = Vec::new();
        let (backend, backend_connection) = loop {
            let Some(backend) = select_backend(candidates, &tried) else {
                error!(
                    service = %self.name,
                    client = %peer_addr,
                    "failed to select a backend for client"
                );
                return;
            };
            debug!(backend = backend.name(), "trying backend for this client");
            match backend.endpoint().dial().await {
                Ok(backend_connection) => {
                    debug!(backend = backend.name(), "backend selected");
                    backend.on_connection_succeeded();
                    break (backend, backend_connection);
                }
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        error = %e,
                        "failed to connect to backend"
                    );
                    backend.on_connection_failed();
                    tried.push(backend);
                }
            }
        };

        let clock = Arc::new(RequestClock::new());
        let (client_read, client_write) = tokio::io::split(connection.stream);
        let (backend_read, backend_write) = tokio::io::split(backend_connection.stream);

        let up_context = PumpContext {
            direction: Direction::FrontendToBackend,
            service: self.name.clone(),
            frontend: frontend.name().to_string(),
            backend: backend.name().to_string(),
            metrics: Arc::clone(&self.metrics),
            clock: Arc::clone(&clock),
        };
        let down_context = PumpContext {
            direction: Direction::BackendToFrontend,
            ..up_context.clone()
        };

        let mode = self.proxy_mode;
        let up = tokio::spawn(pump_half(
            mode,
            up_context,
            client_read,
            backend_write,
            stop.clone(),
            stop_rx_up,
        ));
        let down = tokio::spawn(pump_half(
            mode,
            down_context,
            backend_read,
            client_write,
            stop,
            stop_rx_down,
        ));
        let _ = tokio::join!(up, down);

        debug!(
            service = %self.name,
            client = %peer_addr,
            "client session finished"
        );
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("frontends", &self.frontends.len())
            .field("backends", &self.backends.len())
            .field("proxy_mode", &self.proxy_mode)
            .finish_non_exhaustive()
    }
}

/// One pump direction plus the session stop channel. Whichever half
/// finishes first signals the other, which shuts its destination down and
/// returns; the session then owns no live sockets.
async fn pump_half<R, W>(
    mode: ProxyMode,
    ctx: PumpContext,
    mut src: R,
    mut dst: W,
    stop: broadcast::Sender<()>,
    mut stop_rx: broadcast::Receiver<()>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::select! {
        _ = run_pump(mode, &ctx, &mut src, &mut dst) => {
            // Errors are logged inside the pump; either way the session
            // is over for both halves.
            let _ = stop.send(());
        }
        _ = stop_rx.recv() => {
            let _ = dst.shutdown().await;
        }
    }
}

/// Emits the paired disconnect when the client scope unwinds.
struct DisconnectGuard<'a> {
    metrics: &'a ProxyMetrics,
    service: &'a str,
    frontend: &'a str,
    protocol: &'a str,
}

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .on_client_disconnect(self.service, self.frontend, self.protocol);
    }
}

/// Build the optional route table of a service.
fn build_route(config: &ServiceConfig, backends: &[Arc<Backend>]) -> ProxyResult<Option<Route>> {
    if config.routes.is_empty() && config.default_route.is_none() {
        return Ok(None);
    }

    let by_name = |name: &str| -> Option<Arc<Backend>> {
        backends
            .iter()
            .find(|b| b.name() == name)
            .map(Arc::clone)
    };

    // Explicit groups first; member weights may override the base weight.
    let mut groups: BTreeMap<String, Vec<Arc<Backend>>> = BTreeMap::new();
    for (group_name, members) in &config.backend_groups {
        let mut group = Vec::with_capacity(members.len());
        for member in members {
            let base = by_name(&member.name).ok_or_else(|| ProxyError::UnknownBackend {
                name: member.name.clone(),
            })?;
            let backend = match member.weight {
                Some(weight) if weight != base.weight() => Arc::new(base.with_weight(weight)),
                _ => base,
            };
            group.push(backend);
        }
        groups.insert(group_name.clone(), group);
    }
    let groups = if config.no_default_group {
        groups
    } else {
        with_synthetic_groups(backends, groups)
    };

    let group_target = |name: &str| -> ProxyResult<RouteTarget> {
        let group = groups
            .get(name)
            .ok_or_else(|| ProxyError::UnknownBackendGroup {
                name: name.to_string(),
            })?;
        if group.is_empty() {
            return Err(ProxyError::EmptyBackendGroup {
                name: name.to_string(),
            });
        }
        Ok(RouteTarget::Group(group.clone()))
    };

    let mut rules = Vec::with_capacity(config.routes.len());
    for rule in &config.routes {
        let network = CidrNet::parse(&rule.client_addr)?;
        let target = if let Some(backend_name) = &rule.backend {
            RouteTarget::Backend(by_name(backend_name).ok_or_else(|| {
                ProxyError::UnknownBackend {
                    name: backend_name.clone(),
                }
            })?)
        } else if let Some(group_name) = &rule.backend_group {
            group_target(group_name)?
        } else {
            // Config validation guarantees one target; keep a diagnosable
            // error for hand-built configurations.
            return Err(ProxyError::UnknownBackendGroup {
                name: rule.client_addr.clone(),
            });
        };
        rules.push(RouteRule { network, target });
    }

    let default_target = match &config.default_route {
        Some(group_name) => Some(group_target(group_name)?),
        None => None,
    };

    Ok(Some(Route::new(rules, default_target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;

    fn service_config(yaml: &str) -> ServiceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_disabled_service_is_skipped() {
        let config = service_config(
            r#"
            enabled: false
            frontends: [{address: "mqtt://:1883"}]
            backends: [{address: "mqtt://127.0.0.1:11883"}]
            "#,
        );
        let service =
            Service::from_config("svc", &config, Arc::new(ProxyMetrics::new())).unwrap();
        assert!(service.is_none());
    }

    #[test]
    fn test_no_enabled_frontends_fails() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883", enabled: false}]
            backends: [{address: "mqtt://127.0.0.1:11883"}]
            "#,
        );
        let result = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()));
        assert!(matches!(result, Err(ProxyError::NoEnabledFrontends(_))));
    }

    #[test]
    fn test_no_enabled_backends_fails() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends: [{address: "mqtt://127.0.0.1:11883", enabled: false}]
            "#,
        );
        let result = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()));
        assert!(matches!(result, Err(ProxyError::NoEnabledBackends(_))));
    }

    #[test]
    fn test_backend_defaults() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends: [{address: "mqtt://127.0.0.1:11883"}]
            "#,
        );
        let service = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()))
            .unwrap()
            .unwrap();
        let backend = &service.backends()[0];
        assert_eq!(backend.weight(), 1);
        assert_eq!(backend.name(), "mqtt://127.0.0.1:11883");
    }

    #[test]
    fn test_route_building() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends:
              - {address: "mqtt://10.0.0.5:1883", name: b1}
              - {address: "mqtt://10.0.0.6:1883", name: b2}
            routes:
              - {clientAddr: 10.0.0.0/8, backend: b1}
              - {clientAddr: 0.0.0.0/0, backendGroup: all}
            "#,
        );
        let service = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()))
            .unwrap()
            .unwrap();
        let route = service.route.as_ref().unwrap();
        assert_eq!(route.len(), 2);

        let target = route.resolve("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(target.candidates()[0].name(), "b1");

        let target = route.resolve("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(target.candidates().len(), 2);
    }

    #[test]
    fn test_route_group_weight_override() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends:
              - {address: "mqtt://10.0.0.5:1883", name: b1, weight: 1}
            backendGroups:
              primary:
                - {name: b1, weight: 7}
            routes:
              - {clientAddr: 0.0.0.0/0, backendGroup: primary}
            "#,
        );
        let service = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()))
            .unwrap()
            .unwrap();
        let route = service.route.as_ref().unwrap();
        let target = route.resolve("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(target.candidates()[0].weight(), 7);
        // The base backend keeps its own weight.
        assert_eq!(service.backends()[0].weight(), 1);
    }

    #[test]
    fn test_no_default_group_suppresses_synthetics() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends:
              - {address: "mqtt://10.0.0.5:1883", name: b1}
            noDefaultGroup: true
            routes:
              - {clientAddr: 0.0.0.0/0, backendGroup: all}
            "#,
        );
        let result = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()));
        assert!(matches!(
            result,
            Err(ProxyError::UnknownBackendGroup { .. })
        ));
    }

    #[test]
    fn test_route_empty_group_rejected() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://:1883"}]
            backends:
              - {address: "mqtt://10.0.0.5:1883", name: b1}
            routes:
              - {clientAddr: 0.0.0.0/0, backendGroup: wss}
            "#,
        );
        let result = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()));
        assert!(matches!(result, Err(ProxyError::EmptyBackendGroup { .. })));
    }

    #[test]
    fn test_full_config_to_services() {
        let config = load_str(
            r#"
proxy:
  services:
    broker:
      proxyMode: packets
      frontends:
        - address: mqtt://:18311
      backends:
        - address: mqtt://127.0.0.1:18312
"#,
        )
        .unwrap();
        let metrics = Arc::new(ProxyMetrics::new());
        let service = Service::from_config(
            "broker",
            &config.services["broker"],
            Arc::clone(&metrics),
        )
        .unwrap()
        .unwrap();
        assert_eq!(service.name(), "broker");
        assert_eq!(service.proxy_mode, ProxyMode::Packets);
    }

    #[tokio::test]
    async fn test_concurrent_start_rejected() {
        let config = service_config(
            r#"
            frontends: [{address: "mqtt://127.0.0.1:19861"}]
            backends: [{address: "mqtt://127.0.0.1:19862"}]
            "#,
        );
        let service = Service::from_config("svc", &config, Arc::new(ProxyMetrics::new()))
            .unwrap()
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let first = tokio::spawn(Arc::clone(&service).run(shutdown_tx.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let second = Arc::clone(&service).run(shutdown_tx.clone()).await;
        assert!(matches!(second, Err(ProxyError::AlreadyRunning)));

        shutdown_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }
}
