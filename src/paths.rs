//! Path resolution for prefork files.
//!
//! # Base Directory
//! - [`get_prefork_dir`] - `~/.prefork/` (or `PREFORK_HOME`)
//!
//! # Runtime Files
//! - [`get_pidfile_path`] - `~/.prefork/prefork.pid` (supervisor process ID)
//! - [`get_log_path`] - `~/.prefork/logs/prefork.log` (daemon output)
//!
//! # Configuration
//! - [`DEFAULT_CONFIG_FILE`] - `prefork.toml` in the working directory

use anyhow::{Context, Result};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Configuration file used when `-c` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "prefork.toml";

// =============================================================================
// Base Directory
// =============================================================================

/// Get the prefork base directory.
///
/// Resolution order:
/// 1. `PREFORK_HOME` environment variable (if set)
/// 2. `~/.prefork/` (default)
pub fn get_prefork_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("PREFORK_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".prefork"))
}

// =============================================================================
// Runtime Files
// =============================================================================

/// Get the default pidfile path: `~/.prefork/prefork.pid`
pub fn get_pidfile_path() -> Result<PathBuf> {
    Ok(get_prefork_dir()?.join("prefork.pid"))
}

/// Get the log directory path: `~/.prefork/logs/`
pub fn get_logs_dir() -> Result<PathBuf> {
    Ok(get_prefork_dir()?.join("logs"))
}

/// Get the daemon log path: `~/.prefork/logs/prefork.log`
pub fn get_log_path() -> Result<PathBuf> {
    Ok(get_logs_dir()?.join("prefork.log"))
}

/// Read the pid stored in a pidfile.
///
/// Returns `None` if the file doesn't exist or can't be parsed.
pub fn read_pid(path: &Path) -> Option<Pid> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
}
