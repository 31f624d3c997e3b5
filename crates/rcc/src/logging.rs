//! Logger setup and shutdown flushing.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Initialise `env_logger` with `level` as the default filter.
///
/// `RUST_LOG` still overrides the filter. With `file`, records are appended
/// there instead of stderr.
pub fn init_logging(level: &str, file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        let target = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(target)));
    }
    builder
        .try_init()
        .context("Logger was already initialised")
}

/// Push out everything written so far: logger buffers, stdout and stderr.
pub fn flush_logs() {
    log::logger().flush();
    std::io::stdout().flush().ok();
    std::io::stderr().flush().ok();
}
