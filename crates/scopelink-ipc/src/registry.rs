// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Command registry
//!
//! Maps every [`CommandKind`] that may be sent in this run to a [`Route`].
//! Built once at startup from the managers' handler tables and shared
//! read-only afterwards. Broadcast and local kinds are registered up front;
//! a direct kind becomes sendable when exactly one role registers it. The
//! registry is serializable so manager processes receive the same table.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{CommandKind, DeliveryMode, ScriptStep};
use crate::error::{IpcError, Result};
use crate::role::Role;
use crate::wire::Delivery;

/// Handler name used for kinds every manager runner executes
pub const RUNNER_HANDLER: &str = "runner";
/// Handler name used for kinds the router host executes
pub const LOCAL_HANDLER: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub delivery: Delivery,
    pub script_eligible: bool,
    /// `(role, handler name)` pairs; empty for broadcast and local routes
    pub handlers: Vec<(Role, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRegistry {
    routes: AHashMap<CommandKind, Route>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// Registry holding the built-in broadcast and local routes
    pub fn new() -> Self {
        let mut routes = AHashMap::new();
        for kind in CommandKind::BROADCAST {
            routes.insert(
                kind,
                Route {
                    delivery: Delivery::Broadcast,
                    script_eligible: kind.script_eligible(),
                    handlers: Vec::new(),
                },
            );
        }
        for kind in CommandKind::LOCAL {
            routes.insert(
                kind,
                Route {
                    delivery: Delivery::Local,
                    script_eligible: kind.script_eligible(),
                    handlers: Vec::new(),
                },
            );
        }
        Self { routes }
    }

    /// Register `role` as the handler of `kind`
    ///
    /// A second direct handler for the same kind is a [`IpcError::HandlerConflict`].
    /// Registering a broadcast kind is accepted and recorded; local kinds are
    /// reserved for the router host.
    pub fn register(&mut self, role: Role, kind: CommandKind, handler: impl Into<String>) -> Result<()> {
        let handler = handler.into();
        match kind.delivery_mode() {
            DeliveryMode::Local => Err(IpcError::ReservedCommand { kind, attempted: role }),
            DeliveryMode::Broadcast => {
                if let Some(route) = self.routes.get_mut(&kind) {
                    route.handlers.push((role, handler));
                }
                Ok(())
            }
            DeliveryMode::Direct => {
                if let Some(existing) = self.routes.get(&kind) {
                    if let Delivery::Direct(existing) = &existing.delivery {
                        return Err(IpcError::HandlerConflict {
                            kind,
                            existing: existing.clone(),
                            attempted: role,
                        });
                    }
                }
                debug!("[REGISTRY] {:?} -> {}::{}", kind, role, handler);
                self.routes.insert(
                    kind,
                    Route {
                        delivery: Delivery::Direct(role.clone()),
                        script_eligible: kind.script_eligible(),
                        handlers: vec![(role, handler)],
                    },
                );
                Ok(())
            }
        }
    }

    /// Register every kind in `kinds` for `role`
    pub fn register_all<S: Into<String>>(
        &mut self,
        role: &Role,
        kinds: impl IntoIterator<Item = (CommandKind, S)>,
    ) -> Result<()> {
        for (kind, handler) in kinds {
            self.register(role.clone(), kind, handler)?;
        }
        Ok(())
    }

    /// Where a command of `kind` goes; unregistered kinds fail immediately
    pub fn resolve(&self, kind: CommandKind) -> Result<&Delivery> {
        self.routes
            .get(&kind)
            .map(|route| &route.delivery)
            .ok_or(IpcError::UnregisteredCommand(kind))
    }

    pub fn route(&self, kind: CommandKind) -> Option<&Route> {
        self.routes.get(&kind)
    }

    pub fn is_registered(&self, kind: CommandKind) -> bool {
        self.routes.contains_key(&kind)
    }

    /// Direct kinds handled by `role`, sorted
    pub fn direct_kinds_for(&self, role: &Role) -> Vec<CommandKind> {
        let mut kinds: Vec<CommandKind> = self
            .routes
            .iter()
            .filter(|(_, route)| route.delivery == Delivery::Direct(role.clone()))
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Reject a script that references an unregistered or ineligible kind
    pub fn validate_script(&self, steps: &[ScriptStep]) -> Result<()> {
        for step in steps {
            let kind = step.command.kind();
            let route = self.route(kind).ok_or(IpcError::UnregisteredCommand(kind))?;
            if !route.script_eligible {
                return Err(IpcError::NotScriptEligible(kind));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn test_builtin_routes_present() {
        let registry = CommandRegistry::new();
        assert_eq!(registry.resolve(CommandKind::Quit), Ok(&Delivery::Broadcast));
        assert_eq!(registry.resolve(CommandKind::LogException), Ok(&Delivery::Local));
        assert_eq!(
            registry.resolve(CommandKind::MoveFocus),
            Err(IpcError::UnregisteredCommand(CommandKind::MoveFocus))
        );
    }

    #[test]
    fn test_second_direct_handler_rejected() {
        let mut registry = CommandRegistry::new();
        registry
            .register(Role::Hardware("focus".into()), CommandKind::MoveFocus, "move_focus")
            .unwrap();
        let err = registry
            .register(Role::Hardware("stage".into()), CommandKind::MoveFocus, "move_focus")
            .unwrap_err();
        assert_eq!(
            err,
            IpcError::HandlerConflict {
                kind: CommandKind::MoveFocus,
                existing: Role::Hardware("focus".into()),
                attempted: Role::Hardware("stage".into()),
            }
        );
        // First registration is untouched
        assert_eq!(
            registry.resolve(CommandKind::MoveFocus),
            Ok(&Delivery::Direct(Role::Hardware("focus".into())))
        );
    }

    #[test]
    fn test_local_kinds_reserved() {
        let mut registry = CommandRegistry::new();
        assert!(matches!(
            registry.register(Role::Camera, CommandKind::TaskFailed, "task_failed"),
            Err(IpcError::ReservedCommand { .. })
        ));
    }

    #[test]
    fn test_broadcast_registration_accumulates() {
        let mut registry = CommandRegistry::new();
        registry.register(Role::Camera, CommandKind::Quit, RUNNER_HANDLER).unwrap();
        registry.register(Role::WorkerPool, CommandKind::Quit, RUNNER_HANDLER).unwrap();
        assert_eq!(registry.route(CommandKind::Quit).unwrap().handlers.len(), 2);
    }

    #[test]
    fn test_validate_script() {
        let mut registry = CommandRegistry::new();
        registry.register(Role::Scripting, CommandKind::Sleep, "sleep").unwrap();
        registry
            .register(Role::Camera, CommandKind::GetCameraSetting, "get_camera_setting")
            .unwrap();

        let ok = vec![
            ScriptStep::new(Command::SetAcquisitionOn { value: true }),
            ScriptStep::waiting(Command::Sleep { seconds: 1.0 }),
        ];
        assert_eq!(registry.validate_script(&ok), Ok(()));

        let unregistered = vec![ScriptStep::new(Command::MoveFocus { dz: 1.0 })];
        assert_eq!(
            registry.validate_script(&unregistered),
            Err(IpcError::UnregisteredCommand(CommandKind::MoveFocus))
        );

        let ineligible = vec![ScriptStep::new(Command::GetCameraSetting { name: "gain".into() })];
        assert_eq!(
            registry.validate_script(&ineligible),
            Err(IpcError::NotScriptEligible(CommandKind::GetCameraSetting))
        );
    }

    #[test]
    fn test_direct_kinds_for_role() {
        let mut registry = CommandRegistry::new();
        registry
            .register_all(
                &Role::Scripting,
                [
                    (CommandKind::StartScript, "start_script"),
                    (CommandKind::LoadScript, "load_script"),
                ],
            )
            .unwrap();
        assert_eq!(
            registry.direct_kinds_for(&Role::Scripting),
            vec![CommandKind::LoadScript, CommandKind::StartScript]
        );
        assert!(registry.direct_kinds_for(&Role::Camera).is_empty());
    }

    #[test]
    fn test_registry_survives_bincode() {
        let mut registry = CommandRegistry::new();
        registry
            .register(Role::Hardware("focus".into()), CommandKind::MoveFocus, "move_focus")
            .unwrap();
        let bytes = bincode::serialize(&registry).unwrap();
        let copy: CommandRegistry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(copy.len(), registry.len());
        assert_eq!(
            copy.route(CommandKind::MoveFocus).unwrap().handlers,
            vec![(Role::Hardware("focus".into()), "move_focus".to_string())]
        );
    }
}
