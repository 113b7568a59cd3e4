//! Usage: Process-wide tracing setup (stderr + optional daily rolling file).

use crate::infra::settings::LoggingSettings;
use crate::shared::error::AppResult;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "crm-login.log";

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Installs the global subscriber. The returned guard must outlive the process' logging;
/// dropping it flushes and stops the file writer.
pub fn init(cfg: &LoggingSettings) -> AppResult<Option<WorkerGuard>> {
    // `log` records from dependencies are routed into tracing.
    if let Err(err) = tracing_log::LogTracer::init() {
        eprintln!("log bridge already installed: {err}");
    }

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(build_filter(&cfg.level));

    let (file_layer, guard) = match cfg.directory.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("SYSTEM_ERROR: failed to create log dir: {e}"))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(build_filter(&cfg.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("SYSTEM_ERROR: tracing subscriber init failed: {e}"))?;

    Ok(guard)
}
