// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-role registry
//!
//! One manager per [`Role`]. The orchestrator builds its managers only
//! through [`RoleRegistry::add`] (or its process counterpart), which rejects a second manager for a role
//! and skips roles the configuration disables.

use scopelink_config::RolesConfig;
use scopelink_ipc::Role;
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::manager::{ManagerHost, ManagerProcess, ManagerRunner};

#[derive(Default)]
pub struct RoleRegistry {
    hosts: BTreeMap<Role, Box<dyn ManagerHost>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `manager` under its role
    ///
    /// Returns `Ok(false)` without hosting it when `roles` disables the role.
    pub fn add<M: ManagerProcess>(&mut self, manager: M, roles: &RolesConfig) -> OrchestratorResult<bool> {
        let role = manager.role();
        if !self.admits(&role, roles)? {
            return Ok(false);
        }
        self.hosts.insert(role, Box::new(ManagerRunner::new(manager)));
        Ok(true)
    }

    /// Whether a manager for `role` may be added; a taken role is an error
    pub fn admits(&self, role: &Role, roles: &RolesConfig) -> OrchestratorResult<bool> {
        if self.hosts.contains_key(role) {
            return Err(OrchestratorError::DuplicateRole(role.clone()));
        }
        if !roles.is_enabled(&role.config_key()) {
            info!("[ORCHESTRATOR] Role {} disabled by configuration", role);
            return Ok(false);
        }
        Ok(true)
    }

    /// Host an already-built manager host, such as a manager process
    pub(crate) fn add_host(&mut self, host: Box<dyn ManagerHost>, roles: &RolesConfig) -> OrchestratorResult<bool> {
        let role = host.role();
        if !self.admits(&role, roles)? {
            return Ok(false);
        }
        self.hosts.insert(role, host);
        Ok(true)
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.hosts.contains_key(role)
    }

    pub fn roles(&self) -> Vec<Role> {
        self.hosts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub(crate) fn hosts(&self) -> impl Iterator<Item = &Box<dyn ManagerHost>> {
        self.hosts.values()
    }

    pub(crate) fn hosts_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ManagerHost>> {
        self.hosts.values_mut()
    }

    /// Hand every host over, in role order
    pub(crate) fn take_hosts(&mut self) -> Vec<Box<dyn ManagerHost>> {
        std::mem::take(&mut self.hosts).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{HandlerTable, ManagerContext};
    use crate::error::Result;

    struct Idle(Role);

    impl ManagerProcess for Idle {
        fn role(&self) -> Role {
            self.0.clone()
        }

        fn handlers(&self) -> HandlerTable<Self> {
            HandlerTable::new()
        }

        fn do_main_loop(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let mut registry = RoleRegistry::new();
        let roles = RolesConfig::default();
        assert!(registry.add(Idle(Role::Camera), &roles).unwrap());
        assert!(matches!(
            registry.add(Idle(Role::Camera), &roles),
            Err(OrchestratorError::DuplicateRole(Role::Camera))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disabled_roles_skipped() {
        let mut registry = RoleRegistry::new();
        let roles = RolesConfig {
            scripting: false,
            disabled_hardware: vec!["stage".to_string()],
            ..Default::default()
        };
        assert!(!registry.add(Idle(Role::Scripting), &roles).unwrap());
        assert!(!registry.add(Idle(Role::Hardware("stage".into())), &roles).unwrap());
        assert!(registry.add(Idle(Role::Hardware("focus".into())), &roles).unwrap());
        assert_eq!(registry.roles(), vec![Role::Hardware("focus".into())]);
        assert!(!registry.contains(&Role::Scripting));
    }

    #[test]
    fn test_prebuilt_hosts_share_the_role_checks() {
        let mut registry = RoleRegistry::new();
        let roles = RolesConfig {
            lock_controller: false,
            ..Default::default()
        };
        assert!(registry
            .add_host(Box::new(ManagerRunner::new(Idle(Role::Camera))), &roles)
            .unwrap());
        assert!(matches!(
            registry.add(Idle(Role::Camera), &roles),
            Err(OrchestratorError::DuplicateRole(Role::Camera))
        ));
        assert!(!registry
            .add_host(Box::new(ManagerRunner::new(Idle(Role::LockController))), &roles)
            .unwrap());
        assert!(matches!(registry.admits(&Role::Camera, &roles), Err(_)));
        assert!(registry.admits(&Role::Scripting, &roles).unwrap());
    }
}
