// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Ensures configuration values are within valid ranges and consistent with
//! each other. Every problem is collected so one failed load reports them all.

use crate::{ConfigError, ConfigResult, ScopeConfig};

/// Pixel depths the video buffer can store
pub const SUPPORTED_BITS: [u32; 4] = [8, 16, 32, 64];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validation errors that can occur during config validation
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

fn invalid(errors: &mut Vec<ConfigValidationError>, field: &str, reason: impl Into<String>) {
    errors.push(ConfigValidationError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    });
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every failed check
pub fn validate_config(config: &ScopeConfig) -> ConfigResult<()> {
    let errors = collect_errors(config);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

/// Run every check and return the failures
pub fn collect_errors(config: &ScopeConfig) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    validate_required_fields(config, &mut errors);
    validate_buffers(config, &mut errors);
    validate_camera(config, &mut errors);
    validate_pool(config, &mut errors);
    validate_lock_loops(config, &mut errors);
    validate_control_plane(config, &mut errors);

    errors
}

fn validate_required_fields(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.buffers.segment_dir.as_os_str().is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "buffers.segment_dir".to_string(),
        });
    }
    if config.z_lock.actuator.is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "z_lock.actuator".to_string(),
        });
    }
}

fn validate_buffers(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    let buffers = &config.buffers;
    // The camera purges when one slot is left, so two is the smallest useful ring
    if buffers.video_stacks < 2 {
        invalid(errors, "buffers.video_stacks", "must be at least 2");
    }
    if buffers.video_stack_depth == 0 {
        invalid(errors, "buffers.video_stack_depth", "must be at least 1");
    }
    if buffers.tracks_rows == 0 {
        invalid(errors, "buffers.tracks_rows", "must be at least 1");
    }
    if !(0.0..1.0).contains(&buffers.low_water) {
        invalid(errors, "buffers.low_water", "must be in [0.0, 1.0)");
    }
}

fn validate_camera(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    let camera = &config.camera;
    if camera.width == 0 || camera.height == 0 {
        invalid(errors, "camera.width/height", "frame dimensions must be non-zero");
    }
    if !SUPPORTED_BITS.contains(&camera.bits) {
        invalid(
            errors,
            "camera.bits",
            format!("{} is not one of {:?}", camera.bits, SUPPORTED_BITS),
        );
    }
    if !(camera.nm_per_px > 0.0) {
        invalid(errors, "camera.nm_per_px", "must be positive");
    }
    if camera.roi < 8 || camera.roi % 2 != 0 {
        invalid(errors, "camera.roi", "must be even and at least 8");
    }
}

fn validate_pool(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.pool.workers == 0 {
        invalid(errors, "pool.workers", "must be at least 1");
    }
    if config.pool.queue_capacity == 0 {
        invalid(errors, "pool.queue_capacity", "must be at least 1");
    }
}

fn validate_lock_loops(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    let xy = &config.xy_lock;
    if !(xy.interval_s >= 0.0) {
        invalid(errors, "xy_lock.interval_s", "must not be negative");
    }
    if !(xy.max_step > 0.0) {
        invalid(errors, "xy_lock.max_step", "must be positive");
    }
    if !(xy.min_step >= 0.0) {
        invalid(errors, "xy_lock.min_step", "must not be negative");
    }
    if !(xy.resolution > 0.0) {
        invalid(errors, "xy_lock.resolution", "must be positive");
    }
    if xy.window == 0 {
        invalid(errors, "xy_lock.window", "must be at least 1");
    }

    let z = &config.z_lock;
    if !(z.interval_s >= 0.0) {
        invalid(errors, "z_lock.interval_s", "must not be negative");
    }
    if !(z.max_step > 0.0) {
        invalid(errors, "z_lock.max_step", "must be positive");
    }
    if !(z.min_step >= 0.0) {
        invalid(errors, "z_lock.min_step", "must not be negative");
    }
    if !(z.resolution > 0.0) {
        invalid(errors, "z_lock.resolution", "must be positive");
    }
}

fn validate_control_plane(config: &ScopeConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.channels.capacity == 0 {
        invalid(errors, "channels.capacity", "must be at least 1");
    }
    if config.channels.router_poll_ms == 0 {
        invalid(errors, "channels.router_poll_ms", "router wait must be bounded and non-zero");
    }
    if config.channels.backlog_limit == 0 {
        invalid(errors, "channels.backlog_limit", "must be at least 1");
    }
    let bind = &config.processes.bind_address;
    if !(bind.starts_with("tcp://") || bind.starts_with("ipc://")) {
        invalid(
            errors,
            "processes.bind_address",
            format!("'{}' is not a tcp:// or ipc:// endpoint", bind),
        );
    }
    if config.processes.handshake_timeout_ms == 0 {
        invalid(errors, "processes.handshake_timeout_ms", "must be at least 1");
    }
    if config.shutdown.timeout_ms == 0 {
        invalid(errors, "shutdown.timeout_ms", "must be at least 1");
    }
    if !LOG_LEVELS.contains(&config.logging.level.to_lowercase().as_str()) {
        invalid(
            errors,
            "logging.level",
            format!("'{}' is not one of {:?}", config.logging.level, LOG_LEVELS),
        );
    }
}
