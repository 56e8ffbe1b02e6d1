//! Logging bootstrap
//!
//! The terminal belongs to the operator, so logs always go to a file through
//! a non-blocking writer. `RUST_LOG` overrides the configured level.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use siptty_engine_core::config::GeneralConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Log file used when the configuration names none
pub const DEFAULT_LOG_FILE: &str = "siptty.log";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LoggingConfig {
    pub fn from_general(general: &GeneralConfig) -> Self {
        Self {
            level: level_from_config(general.log_level),
            file: general
                .log_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        }
    }

    /// Filter directive string for this level, e.g. `info`
    pub fn directive(&self) -> String {
        self.level.as_str().to_ascii_lowercase()
    }
}

/// Map the numeric config level: 1 error, 2 warn, 3 info, 4+ debug.
///
/// 0 means unset and maps to info.
pub fn level_from_config(level: u8) -> Level {
    match level {
        1 => Level::ERROR,
        2 => Level::WARN,
        0 | 3 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Install the global subscriber writing to the configured file.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    let (dir, file_name) = split_log_path(&config.file)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))?;

    tracing::info!(file = %config.file.display(), level = %config.level, "logging initialized");
    Ok(guard)
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, &std::ffi::OsStr)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file {} has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, file_name))
}
