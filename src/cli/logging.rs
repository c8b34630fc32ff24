//! Logging initialization

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Initialize logging.
///
/// With `debug`, everything at debug level goes to a temporary log file whose
/// path is returned. Otherwise `level` goes to stderr. `RUST_LOG` overrides
/// both.
pub fn init_logging(debug: bool, level: &str) -> Result<Option<PathBuf>> {
    if debug {
        // Create a temporary log file using tempfile crate for cross-platform support
        let temp_file = tempfile::Builder::new()
            .prefix("kubesync-")
            .suffix(".log")
            .tempfile()
            .map(|f| {
                let path = f.path().to_path_buf();
                // Keep the file after exit
                std::mem::forget(f);
                path
            })
            .unwrap_or_else(|_| {
                std::env::temp_dir().join(format!("kubesync-{}.log", std::process::id()))
            });

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_file)
            .with_context(|| format!("Failed to open log file {}", temp_file.display()))?;

        tracing_subscriber::fmt()
            .with_writer(file)
            .with_env_filter(filter("debug"))
            .with_ansi(false) // No ANSI codes in log file
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .init();

        Ok(Some(temp_file))
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter(level))
            .with_target(false)
            .init();
        Ok(None)
    }
}

fn filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
