//! mqproxy binary entry point.

use anyhow::Context;
use clap::Parser;
use mqproxy::config;
use mqproxy::logging;
use mqproxy::metrics::{MetricsExporter, ProxyMetrics};
use mqproxy::proxy::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

/// Multi-tenant reverse proxy for MQTT over TCP, TLS and WebSocket.
#[derive(Debug, Parser)]
#[command(name = "mqproxy", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "./config.yml", env = "CONFIG_PATH")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be up yet, so report on stderr as well.
            eprintln!("mqproxy: {e:#}");
            error!(error = %e, "exiting with failure");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = config::load_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    logging::initialize(config.logging.as_ref()).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let metrics = Arc::new(ProxyMetrics::new());
        let exporter = MetricsExporter::start(config.metrics.as_ref(), Arc::clone(&metrics))
            .await
            .context("failed to initialize metrics")?;

        let supervisor = Supervisor::from_config(&config, metrics)
            .context("failed to load services")?;
        let result = supervisor.run().await.context("proxy failed");

        if let Some(exporter) = exporter {
            exporter.stop().await;
        }
        result
    })
}
