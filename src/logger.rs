use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::association::processor::OUTCOME_TARGET;

pub const LOG_FILE: &str = "converge.log";
pub const EVENT_FILE: &str = "associations.json";

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`); `RUST_LOG`
///   wins when set.
/// - human readable logs go to stdout and to a daily rolling `LOG_FILE`.
/// - association outcome events also go, as newline-delimited JSON, to a
///   daily rolling `EVENT_FILE`, whatever `log_level` is.
pub fn init_tracing(log_dir: &Path, log_level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("could not create log directory {}", log_dir.display()))?;

    let stdout_layer = fmt::layer().with_target(false).with_filter(level_filter(log_level));

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(level_filter(log_level));

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, EVENT_FILE);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{OUTCOME_TARGET}=info")));

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(())
}

/// Console-only logging for the short-lived commands.
pub fn init_console(log_level: &str) {
    let _ = Registry::default()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(level_filter(log_level)),
        )
        .try_init();
}

fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}
