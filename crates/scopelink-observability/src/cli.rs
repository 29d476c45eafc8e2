// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! CLI argument parsing for per-crate debug flags
//!
//! Supports flags like `--debug-scopelink-ipc`, `--debug-scopelink-buffers`,
//! etc. to raise one crate to debug level without flooding the rest.

use std::collections::HashMap;
use std::env;

use crate::{crate_target, KNOWN_CRATES};

/// Per-crate debug switches
///
/// # Example
/// ```rust
/// use scopelink_observability::CrateDebugFlags;
///
/// let flags = CrateDebugFlags::from_args(vec!["--debug-scopelink-ipc".to_string()]);
/// assert!(flags.is_enabled("scopelink-ipc"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CrateDebugFlags {
    pub enabled_crates: HashMap<String, bool>,
    /// Level for everything not switched to debug
    pub base_level: Option<String>,
}

impl CrateDebugFlags {
    /// Parse debug flags from command-line arguments
    ///
    /// Looks for arguments matching `--debug-{crate-name}`.
    /// Also supports `--debug-all` to enable all crates.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut flags = CrateDebugFlags::default();

        for arg in args {
            if arg == "--debug-all" {
                flags.enable_all();
                continue;
            }

            if let Some(crate_name) = arg.strip_prefix("--debug-") {
                flags.enabled_crates.insert(crate_name.to_string(), true);
            }
        }

        flags
    }

    fn enable_all(&mut self) {
        for crate_name in KNOWN_CRATES {
            self.enabled_crates.insert(crate_name.to_string(), true);
        }
    }

    /// Use `level` instead of `info` for crates without a debug flag
    pub fn with_base_level(mut self, level: impl Into<String>) -> Self {
        self.base_level = Some(level.into());
        self
    }

    /// Check if debug is enabled for a specific crate
    pub fn is_enabled(&self, crate_name: &str) -> bool {
        self.enabled_crates.contains_key(crate_name)
    }

    /// Check if debug is enabled for any crate
    pub fn any_enabled(&self) -> bool {
        !self.enabled_crates.is_empty()
    }

    /// Log level for a crate
    pub fn log_level(&self, crate_name: &str) -> tracing::Level {
        if self.is_enabled(crate_name) {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Filter string usable with `EnvFilter`
    ///
    /// Format: `scopelink_ipc=debug,info`, or just the base level when no
    /// crate is switched on. Entries are sorted so the string is stable.
    pub fn to_filter_string(&self) -> String {
        let base = self.base_level.clone().unwrap_or_else(|| "info".to_string());
        if self.enabled_crates.is_empty() {
            return base;
        }

        let mut filters: Vec<String> = self
            .enabled_crates
            .keys()
            .map(|crate_name| format!("{}=debug", crate_target(crate_name)))
            .collect();
        filters.sort();
        filters.push(base);
        filters.join(",")
    }
}

/// Parse debug flags from the process arguments and `SCOPELINK_DEBUG`
///
/// Environment variable format: comma-separated crate names, e.g.
/// `scopelink-ipc,scopelink-runtime`, or `all`.
pub fn parse_debug_flags() -> CrateDebugFlags {
    let mut flags = CrateDebugFlags::from_args(env::args());
    if let Ok(env_var) = env::var("SCOPELINK_DEBUG") {
        apply_debug_env(&mut flags, &env_var);
    }
    flags
}

fn apply_debug_env(flags: &mut CrateDebugFlags, env_var: &str) {
    if env_var == "all" {
        flags.enable_all();
        return;
    }
    for crate_name in env_var.split(',') {
        let crate_name = crate_name.trim();
        if !crate_name.is_empty() {
            flags.enabled_crates.insert(crate_name.to_string(), true);
        }
    }
}

/// Generate help text for debug flags
pub fn debug_flags_help() -> String {
    format!(
        r#"Debug Flags:
  --debug-all                    Enable debug logging for all crates
  --debug-{{crate-name}}          Enable debug logging for specific crate

Available crates:
  {}

Environment Variable:
  SCOPELINK_DEBUG={{crate-name}}[,{{crate-name}}]  Enable debug for crates (comma-separated)
  SCOPELINK_DEBUG=all                               Enable debug for all crates
"#,
        KNOWN_CRATES.join(", ")
    )
}
