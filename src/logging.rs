//! Logging front-end.
//!
//! Maps the `proxy.logging` configuration onto a `tracing-subscriber`
//! installation. Initialization is process-wide and explicit; nothing here
//! relies on implicit construction order.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber from configuration.
///
/// `""`, `"-"` and `"stdout"` log to stdout, `"stderr"` to stderr, anything
/// else is treated as a file path (parent directories are created). A
/// `verbosity` greater than zero lowers the level floor one step per unit,
/// bottoming out at `trace`.
///
/// # Errors
///
/// Returns an error if a log file cannot be opened or a subscriber is
/// already installed.
pub fn initialize(config: Option<&LoggingConfig>) -> io::Result<()> {
    let default = LoggingConfig::default();
    let config = config.unwrap_or(&default);

    let level = effective_level(
        config.level.as_deref().unwrap_or("info"),
        config.verbosity.unwrap_or(0),
    );
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let install_result = match config.output.as_str() {
        "" | "-" | "stdout" => builder.with_writer(io::stdout).try_init(),
        "2" | "stderr" => builder.with_writer(io::stderr).try_init(),
        path => {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() && !dir.exists() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .try_init()
        }
    };

    install_result.map_err(|e| io::Error::other(e.to_string()))
}

/// Combine a level name with a verbosity offset into a filter directive.
fn effective_level(level: &str, verbosity: i32) -> String {
    const LADDER: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let base = LADDER
        .iter()
        .position(|l| l.eq_ignore_ascii_case(level))
        .unwrap_or(2);
    let raised = (base as i64 + i64::from(verbosity.max(0))).min(LADDER.len() as i64 - 1);
    LADDER[raised as usize].to_string()
}
