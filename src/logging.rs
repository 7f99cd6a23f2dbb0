//! Logging initialization and configuration.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Initialize the logging system: stdout plus a daily-rolling file under
/// the configured log directory.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let log_dir = cfg.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("denbox=info"));

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("denbox")
        .filename_suffix("log")
        .build(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    // keep the writer alive for the process lifetime
    std::mem::forget(guard);

    tracing::info!(dir = %log_dir.display(), "Logging initialized");
    Ok(())
}

/// Plain stdout logging for one-shot commands that don't need the
/// rolling file.
pub fn init_simple_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "denbox=info".into()),
        )
        .init();
}
