//! Logging initialization and configuration.
//!
//! Logs always go to stderr; stdout belongs to the sandboxed program.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn timer() -> ChronoLocal {
    ChronoLocal::new(TIMESTAMP_FORMAT.to_string())
}

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` overrides the configured level. When a log directory is set,
/// the returned guard must be held until exit so buffered lines are flushed.
pub fn init_logging(cfg: &LogConfig) -> Result<Option<WorkerGuard>> {
    let level = parse_log_level(&cfg.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sandbox_bridge={}", level)));

    let format = cfg.format.to_lowercase();
    let (file_writer, guard) = match &cfg.dir {
        Some(dir) => {
            let (writer, guard) = file_writer(Path::new(dir), &format)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match format.as_str() {
        "json" => {
            let file_layer = file_writer.map(|w| {
                fmt::layer()
                    .json()
                    .with_writer(w)
                    .with_timer(timer())
                    .with_target(cfg.show_target)
            });
            let stderr_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_timer(timer())
                .with_target(cfg.show_target);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()?;
        }
        "compact" => {
            let file_layer = file_writer.map(|w| {
                fmt::layer()
                    .compact()
                    .with_writer(w)
                    .with_ansi(false)
                    .with_timer(timer())
                    .with_target(cfg.show_target)
            });
            let stderr_layer = fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_timer(timer())
                .with_target(cfg.show_target);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()?;
        }
        _ => {
            let file_layer = file_writer.map(|w| {
                fmt::layer()
                    .with_writer(w)
                    .with_ansi(false)
                    .with_timer(timer())
                    .with_target(cfg.show_target)
            });
            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(timer())
                .with_target(cfg.show_target);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(stderr_layer)
                .try_init()?;
        }
    }

    tracing::debug!(
        level = %cfg.level,
        format = %cfg.format,
        dir = ?cfg.dir,
        "Logging initialized"
    );
    Ok(guard)
}

/// Daily-rolled `sandbox-bridge.yyyy-MM-dd.{log,json}` under `dir`.
fn file_writer(dir: &Path, format: &str) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let suffix = if format == "json" { "json" } else { "log" };
    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("sandbox-bridge")
        .filename_suffix(suffix)
        .build(dir)
        .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Parse log level string to a filter directive.
fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Initialize simple logging for commands that don't load config.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "sandbox_bridge=warn".into()),
        )
        .try_init();
}
