// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process roles. Each role is bound to exactly one live manager per run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Camera,
    WorkerPool,
    LockController,
    Scripting,
    Presentation,
    /// User-added hardware manager, keyed by device name
    Hardware(String),
}

impl Role {
    /// Key used by `RolesConfig::is_enabled`
    pub fn config_key(&self) -> String {
        match self {
            Role::Camera => "camera".to_string(),
            Role::WorkerPool => "worker_pool".to_string(),
            Role::LockController => "lock_controller".to_string(),
            Role::Scripting => "scripting".to_string(),
            Role::Presentation => "presentation".to_string(),
            Role::Hardware(name) => format!("hardware.{}", name),
        }
    }

    /// OS thread name for the manager hosting this role
    pub fn thread_name(&self) -> String {
        format!("scopelink-{}", self.config_key().replace('.', "-"))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.config_key())
    }
}

impl FromStr for Role {
    type Err = String;

    /// Inverse of [`Role::config_key`]
    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key {
            "camera" => Ok(Role::Camera),
            "worker_pool" => Ok(Role::WorkerPool),
            "lock_controller" => Ok(Role::LockController),
            "scripting" => Ok(Role::Scripting),
            "presentation" => Ok(Role::Presentation),
            other => match other.strip_prefix("hardware.") {
                Some(name) if !name.is_empty() => Ok(Role::Hardware(name.to_string())),
                _ => Err(format!("unknown role '{}'", other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_keys() {
        assert_eq!(Role::WorkerPool.config_key(), "worker_pool");
        assert_eq!(Role::Hardware("focus".into()).config_key(), "hardware.focus");
        assert_eq!(Role::Hardware("focus".into()).thread_name(), "scopelink-hardware-focus");
        assert_eq!(Role::LockController.to_string(), "lock_controller");
    }

    #[test]
    fn test_parse_config_keys() {
        for role in [Role::Camera, Role::WorkerPool, Role::Hardware("focus".into())] {
            assert_eq!(role.config_key().parse::<Role>(), Ok(role));
        }
        assert!("hardware.".parse::<Role>().is_err());
        assert!("gui".parse::<Role>().is_err());
    }
}
