//! Tracing setup
//!
//! Console logging always; a per-run log file under `log_path` when one is
//! configured. The file writer is non-blocking, so the returned guard must
//! stay alive for the duration of the run to flush buffered lines.

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::ShuttleConfig;

/// Map the configured level to a tracing directive. CRITICAL collapses into
/// `error`: tracing has no level above it.
fn level_directive(level: &str) -> &'static str {
    match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

pub fn init(config: &ShuttleConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.logging.log_level)));

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match &config.paths.log_path {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let file_name = format!(
                "shuttle_{}_{}.log",
                Local::now().format("%Y%m%d_%H%M%S"),
                std::process::id()
            );
            let file = std::fs::File::create(log_dir.join(&file_name))
                .with_context(|| format!("Failed to create log file {file_name}"))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
