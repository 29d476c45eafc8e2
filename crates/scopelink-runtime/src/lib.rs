// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink Runtime
//!
//! Hosts the managers of one acquisition run.
//!
//! ## Architecture
//! - [`Orchestrator`] builds the command registry, allocates shared buffers,
//!   starts one host thread per manager plus the router thread, and
//!   coordinates shutdown
//! - [`process`] hosts a manager in its own OS process: [`ProcessHost`] on
//!   the orchestrator side, [`serve`] inside the `scopelink-manager` binary
//! - [`ManagerProcess`] is one role's behaviour; [`ManagerRunner`] drives its
//!   setup, main loop, command drain and teardown
//! - [`WorkerPool`] runs per-stack tasks and keeps the shared pool flag
//!   consistent, holding the exclusive lock around tasks that need it
//! - [`managers`] holds the camera, worker-pool, lock-controller, scripting
//!   and hardware managers

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod manager;
pub mod managers;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod resources;
pub mod roles;

pub use error::{ManagerError, OrchestratorError, OrchestratorResult, Result};
pub use manager::{
    AcquisitionState, Handler, HandlerTable, ManagerContext, ManagerHost, ManagerProcess, ManagerRunner,
    ManagerState, ManagerStatus,
};
pub use orchestrator::{Orchestrator, OrchestratorState, ShutdownReport};
pub use pool::{PoolTask, TaskFailure, WorkerPool};
pub use process::{serve, serve_at, ControlMessage, KillSwitch, ProcessHost, ProcessSpec};
pub use resources::{
    new_run_id, overflow_policy, track_col, BufferHandles, BufferRequest, SharedBuffers, SharedResources,
    TRACK_COLUMNS,
};
pub use roles::RoleRegistry;

#[cfg(test)]
pub(crate) mod test_support {
    use scopelink_config::ScopeConfig;
    use scopelink_ipc::{duplex, CommandKind, CommandRegistry, RouterEnd, Role};
    use std::path::Path;
    use std::sync::Arc;

    use crate::resources::{new_run_id, BufferRequest, SharedBuffers, SharedResources};

    /// Tiny run: 4 stacks of 2x8x8 u16 frames, 16 track rows, 2 workers
    pub fn small_config(dir: &Path) -> ScopeConfig {
        let mut config = ScopeConfig::default();
        config.buffers.segment_dir = dir.to_path_buf();
        config.buffers.video_stacks = 4;
        config.buffers.video_stack_depth = 2;
        config.buffers.tracks_rows = 16;
        config.camera.width = 8;
        config.camera.height = 8;
        config.camera.bits = 16;
        config.pool.workers = 2;
        config
    }

    /// Resources for `role`, with `kinds` registered to it
    pub fn harness(
        role: Role,
        config: &ScopeConfig,
        kinds: &[(CommandKind, &'static str)],
    ) -> (SharedResources, RouterEnd, SharedBuffers) {
        let mut registry = CommandRegistry::new();
        registry.register_all(&role, kinds.iter().copied()).unwrap();
        harness_with(role, config, registry, &[])
    }

    pub fn harness_with(
        role: Role,
        config: &ScopeConfig,
        registry: CommandRegistry,
        requests: &[BufferRequest],
    ) -> (SharedResources, RouterEnd, SharedBuffers) {
        let buffers = SharedBuffers::allocate(config, &new_run_id(), requests).unwrap();
        let registry = Arc::new(registry);
        let (manager_end, router_end) = duplex(role.clone(), config.channels.capacity, registry);
        let resources = SharedResources::new(
            role,
            buffers.handles().clone(),
            Arc::new(config.clone()),
            manager_end,
        );
        (resources, router_end, buffers)
    }
}
