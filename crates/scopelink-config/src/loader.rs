// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading with override support
//!
//! Three tiers, later tiers winning:
//! 1. TOML document (base values, defaults for anything omitted)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)
//!
//! The merged result is validated before it is returned.

use crate::{validate_config, ConfigResult, OverflowMode, ScopeConfig};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Parse a TOML document, apply overrides and validate
///
/// # Errors
///
/// Returns `ConfigError::ParseError` for malformed TOML and
/// `ConfigError::ValidationError` when the merged values are inconsistent.
pub fn load_config_str(
    content: &str,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<ScopeConfig> {
    let mut config: ScopeConfig = toml::from_str(content)?;

    apply_environment_overrides(&mut config);

    if let Some(cli) = cli_args {
        apply_cli_overrides(&mut config, cli);
    }

    validate_config(&config)?;
    Ok(config)
}

/// Read the TOML document at `config_path`, then behave as [`load_config_str`]
pub fn load_config(
    config_path: &Path,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<ScopeConfig> {
    let content = fs::read_to_string(config_path)?;
    load_config_str(&content, cli_args)
}

fn parse_bool(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "true" || value == "1" || value == "yes"
}

fn parse_overflow(value: &str) -> Option<OverflowMode> {
    match value.to_lowercase().as_str() {
        "purge" => Some(OverflowMode::Purge),
        "strict" => Some(OverflowMode::Strict),
        _ => None,
    }
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `SCOPELINK_SEGMENT_DIR` -> `buffers.segment_dir`
/// - `SCOPELINK_VIDEO_STACKS` -> `buffers.video_stacks`
/// - `SCOPELINK_OVERFLOW` -> `buffers.overflow` (`purge` / `strict`)
/// - `SCOPELINK_POOL_WORKERS` -> `pool.workers`
/// - `SCOPELINK_XY_LOCK_ON` -> `xy_lock.enabled`
/// - `SCOPELINK_Z_LOCK_ON` -> `z_lock.enabled`
/// - `SCOPELINK_SHUTDOWN_TIMEOUT_MS` -> `shutdown.timeout_ms`
/// - `SCOPELINK_LOG_LEVEL` -> `logging.level`
/// - `SCOPELINK_LOG_DIR` -> `logging.dir`
///
/// Values that fail to parse are ignored.
pub fn apply_environment_overrides(config: &mut ScopeConfig) {
    // Buffers
    if let Ok(value) = env::var("SCOPELINK_SEGMENT_DIR") {
        config.buffers.segment_dir = PathBuf::from(value);
    }
    if let Ok(value) = env::var("SCOPELINK_VIDEO_STACKS") {
        if let Ok(stacks) = value.parse::<usize>() {
            config.buffers.video_stacks = stacks;
        }
    }
    if let Ok(value) = env::var("SCOPELINK_OVERFLOW") {
        if let Some(mode) = parse_overflow(&value) {
            config.buffers.overflow = mode;
        }
    }

    // Pool
    if let Ok(value) = env::var("SCOPELINK_POOL_WORKERS") {
        if let Ok(workers) = value.parse::<usize>() {
            config.pool.workers = workers;
        }
    }

    // Lock loops
    if let Ok(value) = env::var("SCOPELINK_XY_LOCK_ON") {
        config.xy_lock.enabled = parse_bool(&value);
    }
    if let Ok(value) = env::var("SCOPELINK_Z_LOCK_ON") {
        config.z_lock.enabled = parse_bool(&value);
    }

    // Shutdown
    if let Ok(value) = env::var("SCOPELINK_SHUTDOWN_TIMEOUT_MS") {
        if let Ok(timeout) = value.parse::<u64>() {
            config.shutdown.timeout_ms = timeout;
        }
    }

    // Logging
    if let Ok(value) = env::var("SCOPELINK_LOG_LEVEL") {
        config.logging.level = value;
    }
    if let Ok(value) = env::var("SCOPELINK_LOG_DIR") {
        config.logging.dir = PathBuf::from(value);
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - Map of CLI arguments (e.g., `{"pool_workers": "4", "log_level": "debug"}`)
pub fn apply_cli_overrides(config: &mut ScopeConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("segment_dir") {
        config.buffers.segment_dir = PathBuf::from(value);
    }
    if let Some(value) = cli_args.get("video_stacks") {
        if let Ok(stacks) = value.parse::<usize>() {
            config.buffers.video_stacks = stacks;
        }
    }
    if let Some(value) = cli_args.get("overflow") {
        if let Some(mode) = parse_overflow(value) {
            config.buffers.overflow = mode;
        }
    }
    if let Some(value) = cli_args.get("pool_workers") {
        if let Ok(workers) = value.parse::<usize>() {
            config.pool.workers = workers;
        }
    }
    if let Some(value) = cli_args.get("xy_lock") {
        config.xy_lock.enabled = parse_bool(value);
    }
    if let Some(value) = cli_args.get("z_lock") {
        config.z_lock.enabled = parse_bool(value);
    }
    if let Some(value) = cli_args.get("shutdown_timeout_ms") {
        if let Ok(timeout) = value.parse::<u64>() {
            config.shutdown.timeout_ms = timeout;
        }
    }
    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.clone();
    }
}
