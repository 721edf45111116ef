use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes console logging plus, when enabled, a daily-rotated JSON file.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    // Respect RUST_LOG if set; otherwise use the configured default
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let (file_layer, guard) = if config.json_file {
        let _ = fs::create_dir_all(&config.directory);
        let file_appender =
            tracing_appender::rolling::daily(&config.directory, "dte_transmitter.log");
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        (
            Some(fmt::layer().json().with_writer(non_blocking_writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
