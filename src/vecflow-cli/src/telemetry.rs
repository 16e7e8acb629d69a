//! Logging for the `vecflow` binary.
//!
//! Stage and search events go to `vecflow.jsonl` under the log directory, one
//! JSON object per line. A compact copy goes to stderr so stdout stays free
//! for command output.

use anyhow::{Context, Result};
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "vecflow.jsonl";
const MAX_LOG_BYTES: u64 = 32 * 1024 * 1024;
const KEPT_LOG_FILES: usize = 7;

/// Filter used when `RUST_LOG` is unset. Each `-v` raises vecflow's own
/// crates one level; dependencies stay at `warn`.
pub fn default_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,vecflow={level},vecflow_cli={level},vecflow_core={level}")
}

/// Install the global subscriber. Keep the returned guard for the lifetime of
/// the process; dropping it flushes and closes the log file.
pub fn init_telemetry(log_dir: impl AsRef<Path>, verbosity: u8) -> Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let appender = RollingFileAppender::new(
        log_dir.join(LOG_FILE),
        RollingConditionBasic::new().daily().max_size(MAX_LOG_BYTES),
        KEPT_LOG_FILES,
    )
    .context("Failed to open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    // Invocation ids live on the stage span, so every event carries its span list
    let json = fmt::layer()
        .json()
        .flatten_event(true)
        .with_span_list(true)
        .with_current_span(false)
        .with_writer(writer);

    let console = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(console)
        .try_init()
        .context("A global subscriber is already installed")?;

    tracing::debug!(dir = %log_dir.display(), "Logging to {}", LOG_FILE);
    Ok(guard)
}
