//! Logging initialization.
//!
//! Every component logs through `tracing`. The binary calls [`init_logging`]
//! once at startup. That installs:
//! - a JSONL file layer at `<log_dir>/auth.jsonl`
//! - a compact stderr layer for foreground feedback
//!
//! `RUST_LOG` overrides the provided default level.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "auth.jsonl";

/// Initialize the logging system.
///
/// Falls back to stderr-only output when the log file cannot be opened.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logging(level: &str, log_dir: &Path) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = std::fs::create_dir_all(log_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(LOG_FILE_NAME))
    });
    let (file, file_error) = match file {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };

    let json_layer = file.map(|file| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(Arc::new(file))
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(json_layer)
        .with(stderr_layer)
        .try_init();

    if let Some(e) = file_error {
        tracing::warn!(error = %e, "Log file unavailable, logging to stderr only");
    }
}
