// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections of a
//! scopelink TOML document. Every section carries `#[serde(default)]`, so a
//! document only needs to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub buffers: BuffersConfig,
    pub camera: CameraConfig,
    pub pool: PoolConfig,
    pub roles: RolesConfig,
    pub xy_lock: XyLockConfig,
    pub z_lock: ZLockConfig,
    pub channels: ChannelsConfig,
    pub processes: ProcessesConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

/// What a full acquisition buffer does with the next record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Drop the oldest record and keep writing
    #[default]
    Purge,
    /// Refuse the write and leave the buffer untouched
    Strict,
}

/// Shared-memory buffer sizing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BuffersConfig {
    /// Directory holding the segment files (`/dev/shm` on Linux)
    pub segment_dir: PathBuf,
    /// Number of image stacks the video buffer can hold
    pub video_stacks: usize,
    /// Frames per image stack
    pub video_stack_depth: usize,
    /// Rows the tracks buffer can hold
    pub tracks_rows: usize,
    /// Overflow policy applied on acquisition paths
    pub overflow: OverflowMode,
    /// Occupancy the camera purges down to when the video buffer is nearly full
    pub low_water: f64,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            segment_dir: default_segment_dir(),
            video_stacks: 5,
            video_stack_depth: 40,
            tracks_rows: 100_000,
            overflow: OverflowMode::Purge,
            low_water: 0.3,
        }
    }
}

fn default_segment_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

/// Camera geometry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: usize,
    pub height: usize,
    /// Pixel bit depth: 8, 16, 32 or 64
    pub bits: u32,
    /// Object-plane nanometres per camera pixel
    pub nm_per_px: f64,
    /// Bead region-of-interest edge length in pixels (even, at least 8)
    pub roi: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            bits: 16,
            nm_per_px: 5000.0 / 60.0,
            roi: 26,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 16,
        }
    }
}

/// Per-role enable flags
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RolesConfig {
    pub camera: bool,
    pub worker_pool: bool,
    pub lock_controller: bool,
    pub scripting: bool,
    /// Hardware roles (by name) that must not be started
    pub disabled_hardware: Vec<String>,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            camera: true,
            worker_pool: true,
            lock_controller: true,
            scripting: true,
            disabled_hardware: Vec::new(),
        }
    }
}

impl RolesConfig {
    /// Whether the role with the given config key may run.
    ///
    /// Keys are `camera`, `worker_pool`, `lock_controller`, `scripting`,
    /// `presentation` and `hardware.<name>`. Unknown keys are enabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        match key {
            "camera" => self.camera,
            "worker_pool" => self.worker_pool,
            "lock_controller" => self.lock_controller,
            "scripting" => self.scripting,
            other => match other.strip_prefix("hardware.") {
                Some(name) => !self.disabled_hardware.iter().any(|d| d == name),
                None => true,
            },
        }
    }
}

/// XY bead-centering loop
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct XyLockConfig {
    pub enabled: bool,
    /// Seconds between corrections
    pub interval_s: f64,
    /// Largest correction per axis, pixels
    pub max_step: f64,
    /// Newest track rows scanned per pass
    pub window: usize,
    /// Deviation (pixels) below which nothing is emitted
    pub min_step: f64,
    /// Device resolution the correction is rounded to, pixels
    pub resolution: f64,
    /// Rows older than this many seconds are ignored
    pub stale_after_s: f64,
}

impl Default for XyLockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_s: 10.0,
            max_step: 10.0,
            window: 1000,
            min_step: 1.0,
            resolution: 1.0,
            stale_after_s: 1.0,
        }
    }
}

/// Z focus loop
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ZLockConfig {
    pub enabled: bool,
    /// Reference bead id
    pub bead: u32,
    /// Target z position, nanometres
    pub target: f64,
    pub interval_s: f64,
    /// Largest focus move per correction, nanometres
    pub max_step: f64,
    pub min_step: f64,
    pub resolution: f64,
    pub stale_after_s: f64,
    /// Hardware role that drives the focus actuator
    pub actuator: String,
}

impl Default for ZLockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bead: 0,
            target: 0.0,
            interval_s: 10.0,
            max_step: 1000.0,
            min_step: 10.0,
            resolution: 1.0,
            stale_after_s: 1.0,
            actuator: "focus".to_string(),
        }
    }
}

/// Control-plane channel sizing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Frames each direction of a duplex channel can queue
    pub capacity: usize,
    /// Upper bound on one router wait, milliseconds
    pub router_poll_ms: u64,
    /// Manager loop sleep between iterations, milliseconds
    pub idle_sleep_ms: u64,
    /// Frames the router holds for one destination whose channel is full;
    /// the oldest is dropped beyond this
    pub backlog_limit: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            router_poll_ms: 10,
            idle_sleep_ms: 1,
            backlog_limit: 1024,
        }
    }
}

/// Manager processes launched by the orchestrator
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessesConfig {
    /// zmq endpoint the orchestrator binds one link per manager process on
    pub bind_address: String,
    /// How long a launched process has to connect and introduce itself
    pub handshake_timeout_ms: u64,
    /// How long to wait for a killed process to exit
    pub kill_timeout_ms: u64,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            bind_address: "tcp://127.0.0.1:*".to_string(),
            handshake_timeout_ms: 5000,
            kill_timeout_ms: 1000,
        }
    }
}

/// Graceful-shutdown bounds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub retention_days: u64,
    pub retention_runs: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("./logs"),
            retention_days: 30,
            retention_runs: 10,
        }
    }
}
