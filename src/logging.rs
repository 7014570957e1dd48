use std::path::{Path, PathBuf};

use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE_NAME: &str = "ghosttype.log";

/// Splits an explicit `GHOSTTYPE_LOG_FILE` override into the directory
/// and file-name-prefix pair `tracing_appender::rolling` wants, falling
/// back to `<base>/logs/ghosttype.log` when unset.
fn resolve_log_file(base_path: &Path) -> (PathBuf, String) {
    if let Ok(raw) = std::env::var("GHOSTTYPE_LOG_FILE") {
        let path = PathBuf::from(raw);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| base_path.join("logs"));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_LOG_FILE_NAME.to_string());
        (dir, name)
    } else {
        (base_path.join("logs"), DEFAULT_LOG_FILE_NAME.to_string())
    }
}

/// Initializes the tracing subscriber: a rolling daily file sink plus, in
/// debug builds, a console sink. Level defaults to `info`, overridden by
/// `GHOSTTYPE_LOG` if set, else by the resolved `ServerConfig.log_level`.
pub fn init_logging(base_path: &std::path::Path, config_log_level: &str) {
    let (log_dir, log_file_name) = resolve_log_file(base_path);

    let file_appender = rolling::daily(&log_dir, &log_file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Kept alive for the process lifetime; dropping it would stop the writer.
    std::mem::forget(guard);

    let env_filter = std::env::var("GHOSTTYPE_LOG")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(config_log_level.to_lowercase()));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    #[cfg(debug_assertions)]
    {
        let stdout_layer = fmt::layer().with_target(true).with_thread_ids(false);
        registry.with(stdout_layer).init();
    }

    #[cfg(not(debug_assertions))]
    {
        registry.init();
    }
}
