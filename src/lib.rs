// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink
//!
//! Shared-memory data plane and command-routing control plane for
//! instrument acquisition pipelines.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! scopelink = "0.1"  # Default: runtime + observability
//! ```
//!
//! ## Feature Flags
//!
//! - **`runtime`** (default): manager lifecycle, orchestrator, worker pool,
//!   lock controller, camera / scripting / hardware managers
//! - **`observability`** (default): logging initialisation and per-crate
//!   debug flags
//!
//! Configuration, buffers and the IPC layer are always available.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scopelink::prelude::*;
//! use std::sync::Arc;
//!
//! let config = load_config_str("[buffers]\nsegment_dir = \"/dev/shm\"\n", None)?;
//! let nm_per_px = config.camera.nm_per_px;
//! let mut orchestrator = Orchestrator::new(config)?;
//! orchestrator.add_manager(CameraManager::new(SimulatedCamera::new()))?;
//! orchestrator.add_manager(WorkerPoolManager::new(Arc::new(StaticRoiProcessor { nm_per_px })))?;
//! orchestrator.add_manager(LockController::new())?;
//! let report = orchestrator.run()?;
//! report.ensure_clean()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Foundation: scopelink-config, scopelink-observability  │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Data plane: scopelink-buffers                          │
//! │  (ring / video / matrix buffers, pool flag, lock)       │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Control plane: scopelink-ipc                           │
//! │  (commands, registry, channels, router)                 │
//! └─────────────────────────────────────────────────────────┘
//!                         ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Runtime: scopelink-runtime                             │
//! │  (orchestrator, managers, worker pool)                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## License
//!
//! Apache-2.0

// Re-export foundation
pub use scopelink_config as config;

// Re-export data and control planes
pub use scopelink_buffers as buffers;
pub use scopelink_ipc as ipc;

#[cfg(feature = "runtime")]
pub use scopelink_runtime as runtime;

#[cfg(feature = "observability")]
pub use scopelink_observability as observability;

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::config::{load_config, load_config_str, validate_config, ScopeConfig};

    pub use crate::buffers::{
        BufferError, BufferHandle, ExclusiveLock, MatrixBuffer, OverflowPolicy, PoolFlag, PoolState,
        RingBuffer, StackGeometry, VideoBuffer,
    };

    pub use crate::ipc::{
        BeadMove, BeadRoi, Command, CommandKind, CommandRegistry, IpcError, ManagerEnd, Role, ScriptStatus,
        ScriptStep,
    };

    #[cfg(feature = "runtime")]
    pub use crate::runtime::{
        managers::{
            CameraManager, HardwareDevice, HardwareManager, LockController, ScriptManager, SimulatedCamera,
            SimulatedFocusMotor, StackProcessor, StaticRoiProcessor, WorkerPoolManager,
        },
        HandlerTable, ManagerContext, ManagerError, ManagerProcess, Orchestrator, OrchestratorError,
        ProcessSpec, ShutdownReport,
    };

    #[cfg(feature = "observability")]
    pub use crate::observability::{init_logging_from_config, parse_debug_flags, CrateDebugFlags};
}
