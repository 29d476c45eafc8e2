// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hosts one simulated manager in its own process
//!
//! Started by `Orchestrator::add_process`; the endpoint to connect back to
//! and the role come from the environment.

use anyhow::bail;
use clap::Parser;
use scopelink_ipc::{Role, ROLE_ENV};
use scopelink_observability::{init_logging, CrateDebugFlags};
use scopelink_runtime::managers::{
    CameraManager, HardwareManager, LockController, ScriptManager, SimulatedCamera, SimulatedFocusMotor,
    StaticRoiProcessor, WorkerPoolManager,
};
use scopelink_runtime::process::serve;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// scopelink manager process
#[derive(Parser, Debug)]
#[command(name = "scopelink-manager", version, long_about = None)]
struct Args {
    /// Role to serve, as its configuration key (e.g. "camera", "hardware.focus")
    #[arg(long, env = ROLE_ENV)]
    role: String,

    /// Latency of every simulated focus-motor fetch, in milliseconds
    #[arg(long, default_value_t = 0)]
    fetch_delay_ms: u64,

    /// Object-plane nanometres per pixel for the worker pool's tracker
    #[arg(long, default_value_t = 5000.0 / 60.0)]
    nm_per_px: f64,

    /// Base directory for per-run log folders
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Crates to log at debug level (comma-separated, or "all")
    #[arg(long, value_delimiter = ',')]
    debug: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let flags = CrateDebugFlags::from_args(args.debug.iter().map(|name| format!("--debug-{}", name)));
    let _guard = init_logging(&flags, args.log_dir.clone(), None, None)?;

    let role: Role = args.role.parse().map_err(anyhow::Error::msg)?;
    info!("🦀 [PROCESS] scopelink-manager {} serving {}", env!("CARGO_PKG_VERSION"), role);

    match role {
        Role::Camera => {
            serve(CameraManager::new(SimulatedCamera::new()))?;
        }
        Role::Scripting => {
            serve(ScriptManager::new())?;
        }
        Role::LockController => {
            serve(LockController::new())?;
        }
        Role::WorkerPool => {
            let processor = StaticRoiProcessor {
                nm_per_px: args.nm_per_px,
            };
            serve(WorkerPoolManager::new(Arc::new(processor)))?;
        }
        Role::Hardware(name) if name == "focus" => {
            let motor = SimulatedFocusMotor::default().with_fetch_delay(Duration::from_millis(args.fetch_delay_ms));
            serve(HardwareManager::new(motor))?;
        }
        other => bail!("no simulated manager for {}", other),
    }
    Ok(())
}
