//! Environment-driven logging setup.
//!
//! The probe is a guest inside the host process, so installing a subscriber
//! is best-effort: when the host already set a global `tracing` subscriber,
//! probe logs flow through it and the environment variables here are
//! ignored.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use tracing::{error, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const DEFAULT_LOG_LEVEL: Level = Level::ERROR;

/// Installs a `tracing` subscriber configured from `BLACKFIRE_LOG_LEVEL`
/// (1..4 mapping to Error/Warn/Info/Debug, out-of-range clamped) and
/// `BLACKFIRE_LOG_FILE` (appended to; stderr by default).
pub(crate) fn init_from_env() {
    let mut invalid_level = None;
    let level = match std::env::var("BLACKFIRE_LOG_LEVEL") {
        Ok(v) if !v.is_empty() => match v.parse::<i64>() {
            Ok(n) => level_from(n),
            Err(_) => {
                invalid_level = Some(v);
                DEFAULT_LOG_LEVEL
            }
        },
        _ => DEFAULT_LOG_LEVEL,
    };

    let mut file_error = None;
    let writer = match std::env::var("BLACKFIRE_LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => BoxMakeWriter::new(Arc::new(file)),
                Err(e) => {
                    file_error = Some((path, e));
                    BoxMakeWriter::new(io::stderr)
                }
            }
        }
        _ => BoxMakeWriter::new(io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(writer)
        .try_init();

    // Report env problems through whichever subscriber ended up active.
    if let Some(v) = invalid_level {
        error!(value = %v, "Invalid log level value, using default");
    }
    if let Some((path, e)) = file_error {
        error!(path = %path, error = %e, "Could not open log file, logging to stderr");
    }
}

fn level_from(v: i64) -> Level {
    match v.clamp(1, 4) {
        1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        _ => Level::DEBUG,
    }
}
