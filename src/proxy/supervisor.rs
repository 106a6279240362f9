//! Root supervisor: starts every service, waits for a termination signal,
//! drains everything.

use super::error::{ProxyError, ProxyResult};
use super::service::Service;
use crate::config::ProxyConfig;
use crate::metrics::ProxyMetrics;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Owns all configured services and the shutdown channel.
#[derive(Debug)]
pub struct Supervisor {
    services: Vec<Arc<Service>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    /// Wrap a set of built services.
    #[must_use]
    pub fn new(services: Vec<Arc<Service>>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            services,
            shutdown_tx,
        }
    }

    /// Build every enabled service from configuration.
    ///
    /// # Errors
    ///
    /// Returns the first service construction error.
    pub fn from_config(config: &ProxyConfig, metrics: Arc<ProxyMetrics>) -> ProxyResult<Self> {
        let mut services = Vec::with_capacity(config.services.len());
        for (name, service_config) in &config.services {
            match Service::from_config(name, service_config, Arc::clone(&metrics))? {
                Some(service) => services.push(service),
                None => debug!(service = %name, "ignoring service as it is not enabled"),
            }
        }
        Ok(Self::new(services))
    }

    /// Number of services that will run.
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// A handle for requesting shutdown from elsewhere (tests, embedders).
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until a termination signal arrives, then drain and return.
    ///
    /// # Errors
    ///
    /// Returns the first service failure. A failing service triggers
    /// shutdown of those still running.
    pub async fn run(self) -> ProxyResult<()> {
        let mut tasks = JoinSet::new();
        for service in &self.services {
            tasks.spawn(Arc::clone(service).run(self.shutdown_tx.clone()));
        }
        info!(services = self.services.len(), "all services started");

        let mut result: ProxyResult<()> = Ok(());
        let signal = wait_for_termination();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                () = &mut signal => {
                    info!("close signal received");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(task_result) => {
                        if let Err(e) = flatten(task_result) {
                            error!(error = %e, "service failed; shutting down");
                            if result.is_ok() {
                                result = Err(e);
                            }
                            let _ = self.shutdown_tx.send(());
                            break;
                        }
                    }
                }
            }
        }

        // Drain the remaining services.
        while let Some(task_result) = tasks.join_next().await {
            if let Err(e) = flatten(task_result) {
                error!(error = %e, "service failed during shutdown");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("all services drained");
        result
    }
}

fn flatten(joined: Result<ProxyResult<()>, tokio::task::JoinError>) -> ProxyResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ProxyError::Task(e.to_string())),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;
    use std::time::Duration;

    #[test]
    fn test_disabled_services_are_skipped() {
        let config = load_str(
            r#"
proxy:
  services:
    off:
      enabled: false
      frontends: [{address: "mqtt://127.0.0.1:19871"}]
      backends: [{address: "mqtt://127.0.0.1:19872"}]
"#,
        )
        .unwrap();
        let supervisor =
            Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
        assert_eq!(supervisor.service_count(), 0);
    }

    #[test]
    fn test_invalid_service_fails_construction() {
        let config = load_str(
            r#"
proxy:
  services:
    broken:
      frontends: [{address: "mqtt://127.0.0.1:19873", enabled: false}]
      backends: [{address: "mqtt://127.0.0.1:19874"}]
"#,
        )
        .unwrap();
        let result = Supervisor::from_config(&config, Arc::new(ProxyMetrics::new()));
        assert!(matches!(result, Err(ProxyError::NoEnabledFrontends(_))));
    }

    #[tokio::test]
    async fn test_shutdown_handle_drains() {
        let config = load_str(
            r#"
proxy:
  services:
    broker:
      frontends: [{address: "mqtt://127.0.0.1:19875"}]
      backends: [{address: "mqtt://127.0.0.1:19876"}]
"#,
        )
        .unwrap();
        let supervisor =
            Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
        let shutdown = supervisor.shutdown_handle();

        let run = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_service() {
        let config = load_str(
            r#"
proxy:
  services:
    a:
      frontends: [{address: "mqtt://127.0.0.1:19877"}]
      backends: [{address: "mqtt://127.0.0.1:19878"}]
    b:
      frontends: [{address: "mqtt://127.0.0.1:19877"}]
      backends: [{address: "mqtt://127.0.0.1:19878"}]
"#,
        )
        .unwrap();
        let supervisor =
            Supervisor::from_config(&config, Arc::new(ProxyMetrics::new())).unwrap();
        assert_eq!(supervisor.service_count(), 2);

        // Both services bind the same port; one fails, taking the
        // supervisor down with an error.
        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .unwrap();
        assert!(result.is_err());
    }
}
