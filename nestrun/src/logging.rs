//! Tracing subscriber setup for the binary.

use std::path::Path;

use nestrun_shared::{NestrunError, NestrunResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file name inside the log directory.
pub const LOG_FILE: &str = "nestrun.log";

/// Install the global subscriber: stderr always, plus `log_dir/nestrun.log`
/// when a directory is given. `RUST_LOG` overrides the default `info` level.
///
/// Keep the returned guard alive until exit, or buffered file lines are lost.
pub fn init_logging(log_dir: Option<&Path>) -> NestrunResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                NestrunError::Config(format!("create log directory {}: {}", dir.display(), e))
            })?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()
        .map_err(|e| NestrunError::Config(format!("install tracing subscriber: {}", e)))?;

    Ok(guard)
}
