// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink-observability
//!
//! Logging infrastructure shared by every scopelink crate, with per-crate
//! debug flag support.
//!
//! - [`cli`]: `--debug-<crate>` flags and the `SCOPELINK_DEBUG` variable
//! - [`init`]: console output plus JSON log files in a per-run folder

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

// Re-export commonly used items
pub use cli::*;
pub use init::*;

/// Known scopelink crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "scopelink",
    "scopelink-config",
    "scopelink-buffers",
    "scopelink-ipc",
    "scopelink-runtime",
];

/// Tracing target for a crate name (`scopelink-ipc` logs as `scopelink_ipc`)
pub fn crate_target(crate_name: &str) -> String {
    crate_name.replace('-', "_")
}
