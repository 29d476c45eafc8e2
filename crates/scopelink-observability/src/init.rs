// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Unified logging initialization
//!
//! Console output plus per-crate JSON log files, one folder per run, with
//! retention of old runs.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use scopelink_config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::crate_target;

const RUN_PREFIX: &str = "run_";
const RUN_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Keeps the non-blocking writers alive; logs are flushed when it drops
pub struct LoggingGuard {
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: PathBuf,
}

impl LoggingGuard {
    /// Folder of the current run
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Initialize logging with file output and console output
///
/// Creates a timestamped folder structure:
/// ```text
/// ./logs/
///   └── run_20250101_120000/
///       ├── scopelink-buffers.log
///       ├── scopelink-ipc.log
///       ├── scopelink-runtime.log
///       └── scopelink-all.log (combined)
/// ```
///
/// # Errors
///
/// Fails when the run folder cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(
    debug_flags: &CrateDebugFlags,
    log_dir: Option<PathBuf>,
    retention_days: Option<u64>,
    retention_runs: Option<usize>,
) -> Result<LoggingGuard> {
    let base_log_dir = log_dir.unwrap_or_else(|| PathBuf::from("./logs"));

    let timestamp = Utc::now().format(RUN_FORMAT);
    let run_folder = base_log_dir.join(format!("{}{}", RUN_PREFIX, timestamp));
    std::fs::create_dir_all(&run_folder)
        .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

    cleanup_old_logs(
        &base_log_dir,
        retention_days.unwrap_or(30),
        retention_runs.unwrap_or(10),
    )?;

    let filter = debug_flags.to_filter_string();
    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("Invalid log filter: {}", filter))?;

    let mut layers = Vec::new();
    let mut file_guards = Vec::new();

    // Console layer (human-readable)
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(env_filter)
        .boxed();
    layers.push(console_layer);

    // One JSON file per crate
    for crate_name in crate::KNOWN_CRATES {
        let file_appender = rolling::never(&run_folder, format!("{}.log", crate_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        file_guards.push(guard);

        let level = if debug_flags.is_enabled(crate_name) { "debug" } else { "info" };
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_filter(EnvFilter::new(format!("{}={}", crate_target(crate_name), level)))
            .boxed();
        layers.push(file_layer);
    }

    // Combined log file (all crates)
    let combined_appender = rolling::never(&run_folder, "scopelink-all.log");
    let (combined_non_blocking, combined_guard) = tracing_appender::non_blocking(combined_appender);
    file_guards.push(combined_guard);

    let combined_layer = tracing_subscriber::fmt::layer()
        .with_writer(combined_non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(EnvFilter::new(&filter))
        .boxed();
    layers.push(combined_layer);

    Registry::default()
        .with(layers)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard {
        _file_guards: file_guards,
        log_dir: run_folder,
    })
}

/// Initialize logging from the `[logging]` configuration section
pub fn init_logging_from_config(
    debug_flags: &CrateDebugFlags,
    config: &LoggingConfig,
) -> Result<LoggingGuard> {
    let flags = debug_flags.clone().with_base_level(config.level.to_lowercase());
    init_logging(
        &flags,
        Some(config.dir.clone()),
        Some(config.retention_days),
        Some(config.retention_runs),
    )
}

/// Remove run folders older than `retention_days`, then all but the newest
/// `retention_runs` of the remainder
pub fn cleanup_old_logs(
    base_log_dir: &Path,
    retention_days: u64,
    retention_runs: usize,
) -> Result<()> {
    if !base_log_dir.exists() {
        return Ok(());
    }

    let cutoff = Utc::now().naive_utc() - chrono::Duration::days(retention_days as i64);

    let mut runs: Vec<(PathBuf, NaiveDateTime)> = Vec::new();
    for entry in std::fs::read_dir(base_log_dir)
        .with_context(|| format!("Failed to list {}", base_log_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let stamp = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(RUN_PREFIX))
            .and_then(|s| NaiveDateTime::parse_from_str(s, RUN_FORMAT).ok());
        if let Some(stamp) = stamp {
            runs.push((path, stamp));
        }
    }

    // Newest first
    runs.sort_by(|a, b| b.1.cmp(&a.1));

    for (index, (path, stamp)) in runs.iter().enumerate() {
        if *stamp < cutoff || index >= retention_runs {
            if let Err(e) = std::fs::remove_dir_all(path) {
                eprintln!(
                    "Warning: Failed to remove old log directory {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    Ok(())
}

/// Initialize logging with default settings
pub fn init_logging_default(debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    init_logging(debug_flags, None, None, None)
}
