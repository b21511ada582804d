use std::path::Path;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::proxy::config::LoggingConfig;

// UTC timestamps in RFC 3339.
struct UtcTimer;

impl tracing_subscriber::fmt::time::FormatTime for UtcTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().to_rfc3339())
    }
}

/// Initialize the logging system: console always, file when configured.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logger(config: &LoggingConfig) {
    // Capture log-crate macros from dependencies.
    let _ = tracing_log::LogTracer::init();

    let mut file_guard: Option<tracing_appender::non_blocking::WorkerGuard> = None;
    let mut file_layer = None;

    if let Some(file_path) = config.file_path.as_deref() {
        let path = Path::new(file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "api_buddy.log".to_string());
        let file_appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        file_guard = Some(guard);
        file_layer = Some(
            fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(UtcTimer),
        );
    }

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_timer(UtcTimer);

    let default_directive = config.level.clone().unwrap_or_else(|| "info".to_string());
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Some(guard) = file_guard {
        // The worker guard must outlive the process for the file writer to
        // keep flushing.
        std::mem::forget(guard);
        info!("logging initialized (console + file)");
    } else {
        info!("logging initialized (console)");
    }
}
