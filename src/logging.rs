use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a stdout subscriber. `RUST_LOG` overrides `default_directive`.
/// Calling this more than once is harmless.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .try_init();
}

/// Install a stdout subscriber plus a daily-rolling log file under `dir`.
///
/// Keep the returned guard alive for as long as file logging should be
/// flushed.
pub fn init_file_logging(dir: &Path, prefix: &str, default_directive: &str) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let _ = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init();

    guard
}
