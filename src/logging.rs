//! Process-wide logging to the claudesquad log file.

use crate::config;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;

/// Initializes the `log` facade once at startup, appending to
/// `<tmp>/claudesquad.log`. The TUI owns the terminal, so nothing may log to
/// stdout or stderr after this point. Returns the log file path for the exit
/// epilogue.
pub fn init() -> Result<PathBuf> {
    let path = config::log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("could not open log file {}", path.display()))?;

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();

    Ok(path)
}
