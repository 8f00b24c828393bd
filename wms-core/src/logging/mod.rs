//! Logging setup with a reloadable filter and optional file output.
//!
//! Console output always goes to stdout. When a log directory is given, a
//! daily-rolling file is written as well through a non-blocking writer.

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "wms_core=info,sqlx=warn";

/// Log file name prefix inside the log directory.
const LOG_FILE_NAME: &str = "wms-core.log";

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle on the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
    }

    /// Replace the filter directive at runtime.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| crate::Error::config(format!("Invalid log filter '{directive}': {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload log filter: {e}")))?;
        tracing::info!(filter = directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// Initialize logging.
///
/// The filter comes from `RUST_LOG` when set, otherwise [`DEFAULT_LOG_FILTER`].
/// Keep the returned guard alive for the lifetime of the process, otherwise
/// buffered file output is lost.
pub fn init_logging(log_dir: Option<&str>) -> crate::Result<(LoggingConfig, Option<WorkerGuard>)> {
    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let console_layer = fmt::layer().with_ansi(true).with_timer(LocalTimer);

    let (file_layer, guard, log_path) = match log_dir {
        Some(dir) => {
            let log_path = PathBuf::from(dir);
            std::fs::create_dir_all(&log_path)?;
            let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed();
            (Some(layer), Some(guard), Some(log_path))
        }
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let config = LoggingConfig {
        handle: filter_handle,
        log_dir: log_path,
    };

    Ok((config, guard))
}
