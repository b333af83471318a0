//! Tracing setup for embedders that want the engine's default logging.
//!
//! Logs go to a file under the XDG state dir when one can be opened, else to
//! stderr. Embedding applications with their own subscriber should skip this
//! module entirely.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,idm_core=debug"))
}

/// Where the engine log lives: `$XDG_STATE_HOME/idm/engine.log`.
pub fn log_path() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("idm")?;
    Ok(dirs.get_state_home().join("engine.log"))
}

/// Install a file-backed subscriber; falls back to stderr when the state dir
/// is unusable. Returns the log path actually in use, if any.
pub fn init() -> Result<Option<PathBuf>> {
    match open_log_file() {
        Ok((file, path)) => {
            tracing_subscriber::fmt()
                .with_env_filter(default_filter())
                .with_writer(move || -> Box<dyn std::io::Write + Send> {
                    // Clone per event; fall back to stderr if the handle dies.
                    match file.try_clone() {
                        Ok(f) => Box::new(f),
                        Err(_) => Box::new(std::io::stderr()),
                    }
                })
                .with_ansi(false)
                .init();
            tracing::info!("engine log at {}", path.display());
            Ok(Some(path))
        }
        Err(e) => {
            init_stderr();
            tracing::warn!("log file unavailable ({}), using stderr", e);
            Ok(None)
        }
    }
}

/// Stderr-only subscriber; never fails.
pub fn init_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn open_log_file() -> Result<(fs::File, PathBuf)> {
    let path = log_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok((file, path))
}
