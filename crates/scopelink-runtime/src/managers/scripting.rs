// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Script manager
//!
//! Replays an ordered list of [`ScriptStep`]s, one step per loop iteration.
//! Scripts are checked against the command registry when loaded, so a
//! running script can only send commands some manager handles and that are
//! marked script-eligible. `Sleep` steps are timed here; steps marked
//! `wait` hold the script until some manager sends `UpdateWaiting`.

use scopelink_ipc::{Command, CommandKind, Role, ScriptStatus, ScriptStep};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{HandlerTable, ManagerContext, ManagerProcess};

/// Parse a JSON array of script steps
pub fn load_script_json(json: &str) -> Result<Vec<ScriptStep>> {
    serde_json::from_str(json).map_err(|e| ManagerError::Script(format!("Invalid script: {}", e)))
}

/// Read and parse a JSON script file
pub fn load_script_file(path: &Path) -> Result<Vec<ScriptStep>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ManagerError::Script(format!("Cannot read {}: {}", path.display(), e)))?;
    load_script_json(&json)
}

#[derive(Debug, Default)]
pub struct ScriptManager {
    steps: Vec<ScriptStep>,
    index: usize,
    status: ScriptStatus,
    waiting: bool,
    sleep_until: Option<f64>,
}

impl ScriptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ScriptStatus {
        self.status
    }

    /// Index of the next step to run
    pub fn position(&self) -> usize {
        self.index
    }

    fn set_status(&mut self, ctx: &ManagerContext, status: ScriptStatus) {
        self.status = status;
        info!("[SCRIPT] Status {:?}", status);
        ctx.notify(Command::UpdateScriptStatus { status });
    }

    /// Replace the loaded script; refused while a script runs
    pub fn load(&mut self, ctx: &ManagerContext, steps: Vec<ScriptStep>) {
        if self.status == ScriptStatus::Running {
            warn!("[SCRIPT] Cannot load a script while one is running");
            return;
        }
        self.index = 0;
        self.waiting = false;
        self.sleep_until = None;
        match ctx.registry().validate_script(&steps) {
            Ok(()) => {
                let status = if steps.is_empty() {
                    ScriptStatus::Empty
                } else {
                    ScriptStatus::Loaded
                };
                debug!("[SCRIPT] Loaded {} step(s)", steps.len());
                self.steps = steps;
                self.set_status(ctx, status);
            }
            Err(e) => {
                warn!("[SCRIPT] Script rejected: {}", e);
                self.steps.clear();
                self.set_status(ctx, ScriptStatus::Error);
                ctx.notify(Command::ShowError {
                    text: "Script is invalid. No script loaded.".to_string(),
                    details: Some(e.to_string()),
                });
            }
        }
    }

    /// Run at most one step at `now`
    pub fn tick(&mut self, ctx: &mut ManagerContext, now: f64) -> Result<()> {
        if self.status != ScriptStatus::Running {
            return Ok(());
        }
        if let Some(until) = self.sleep_until {
            if now >= until {
                self.sleep_until = None;
                self.waiting = false;
            }
            return Ok(());
        }
        if self.waiting {
            return Ok(());
        }
        let Some(step) = self.steps.get(self.index).cloned() else {
            self.set_status(ctx, ScriptStatus::Finished);
            return Ok(());
        };
        self.index += 1;
        ctx.notify(Command::UpdateScriptProgress {
            current_step: self.index as u32,
            total_steps: self.steps.len() as u32,
            description: Some(step.command.describe()),
        });

        match step.command {
            Command::Sleep { seconds } => self.start_sleep(now, seconds),
            command => {
                if let Err(e) = ctx.send(command) {
                    self.set_status(ctx, ScriptStatus::Error);
                    return Err(e);
                }
                self.waiting = step.wait;
            }
        }

        if self.index >= self.steps.len() {
            self.set_status(ctx, ScriptStatus::Finished);
        }
        Ok(())
    }

    fn start_sleep(&mut self, now: f64, seconds: f64) {
        self.sleep_until = Some(now + seconds.max(0.0));
        self.waiting = true;
    }

    fn on_load_script(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::LoadScript { steps } = command {
            self.load(ctx, steps);
        }
        Ok(())
    }

    fn on_start_script(&mut self, ctx: &mut ManagerContext, _command: Command) -> Result<()> {
        match self.status {
            ScriptStatus::Empty | ScriptStatus::Error => {
                warn!("[SCRIPT] Cannot start: no script is loaded");
            }
            ScriptStatus::Running => warn!("[SCRIPT] Cannot start: already running"),
            _ => {
                self.index = 0;
                self.waiting = false;
                self.sleep_until = None;
                self.set_status(ctx, ScriptStatus::Running);
            }
        }
        Ok(())
    }

    fn on_pause_script(&mut self, ctx: &mut ManagerContext, _command: Command) -> Result<()> {
        if self.status == ScriptStatus::Running {
            self.set_status(ctx, ScriptStatus::Paused);
        } else {
            warn!("[SCRIPT] Cannot pause: not running");
        }
        Ok(())
    }

    fn on_resume_script(&mut self, ctx: &mut ManagerContext, _command: Command) -> Result<()> {
        if self.status == ScriptStatus::Paused {
            self.set_status(ctx, ScriptStatus::Running);
        } else {
            warn!("[SCRIPT] Cannot resume: not paused");
        }
        Ok(())
    }

    fn on_update_waiting(&mut self, _ctx: &mut ManagerContext, _command: Command) -> Result<()> {
        self.waiting = false;
        Ok(())
    }

    fn on_sleep(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::Sleep { seconds } = command {
            let now = ctx.now();
            self.start_sleep(now, seconds);
        }
        Ok(())
    }
}

impl ManagerProcess for ScriptManager {
    fn role(&self) -> Role {
        Role::Scripting
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
            .on(CommandKind::LoadScript, "load_script", Self::on_load_script)
            .on(CommandKind::StartScript, "start_script", Self::on_start_script)
            .on(CommandKind::PauseScript, "pause_script", Self::on_pause_script)
            .on(CommandKind::ResumeScript, "resume_script", Self::on_resume_script)
            .on(CommandKind::UpdateWaiting, "update_waiting", Self::on_update_waiting)
            .on(CommandKind::Sleep, "start_sleep", Self::on_sleep)
    }

    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        let now = ctx.now();
        self.tick(ctx, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerStatus;
    use crate::test_support::{harness_with, small_config};
    use scopelink_ipc::{CommandRegistry, Envelope, RouterEnd};
    use tempfile::tempdir;

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry
            .register_all(&Role::Scripting, ScriptManager::new().handlers().registrations())
            .unwrap();
        registry
            .register_all(
                &Role::Presentation,
                [
                    (CommandKind::UpdateScriptStatus, "update_script_status"),
                    (CommandKind::UpdateScriptProgress, "update_script_progress"),
                    (CommandKind::ShowMessage, "show_message"),
                    (CommandKind::ShowError, "show_error"),
                ],
            )
            .unwrap();
        registry
    }

    fn drain(router_end: &RouterEnd) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(Some(Envelope { payload, .. })) = router_end.try_recv() {
            out.push(payload);
        }
        out
    }

    fn statuses(commands: &[Command]) -> Vec<ScriptStatus> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::UpdateScriptStatus { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_load_script_json() {
        let steps = load_script_json(
            r#"[
                {"command": {"ShowMessage": {"text": "hello", "details": null}}, "wait": true},
                {"command": {"Sleep": {"seconds": 0.5}}}
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].wait);
        assert!(!steps[1].wait);
        assert!(matches!(load_script_json("{"), Err(ManagerError::Script(_))));
        assert!(load_script_file(Path::new("/nonexistent/script.json")).is_err());
    }

    #[test]
    fn test_script_runs_with_wait_and_sleep() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, router_end, _buffers) =
            harness_with(Role::Scripting, &config, registry(), &[]);
        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut manager = ScriptManager::new();

        manager.load(
            &ctx,
            vec![
                ScriptStep::waiting(Command::ShowMessage { text: "hi".into(), details: None }),
                ScriptStep::new(Command::Sleep { seconds: 0.5 }),
                ScriptStep::new(Command::SetAcquisitionOn { value: false }),
            ],
        );
        assert_eq!(manager.status(), ScriptStatus::Loaded);
        manager.on_start_script(&mut ctx, Command::StartScript).unwrap();

        manager.tick(&mut ctx, 0.0).unwrap();
        assert_eq!(manager.position(), 1);
        manager.tick(&mut ctx, 1.0).unwrap();
        assert_eq!(manager.position(), 1, "held by wait");

        manager.on_update_waiting(&mut ctx, Command::UpdateWaiting).unwrap();
        manager.tick(&mut ctx, 1.0).unwrap();
        assert_eq!(manager.position(), 2);
        manager.tick(&mut ctx, 1.2).unwrap();
        manager.tick(&mut ctx, 1.6).unwrap();
        assert_eq!(manager.position(), 2, "sleep just ended");
        manager.tick(&mut ctx, 1.7).unwrap();
        assert_eq!(manager.status(), ScriptStatus::Finished);

        let sent = drain(&router_end);
        assert_eq!(
            statuses(&sent),
            vec![ScriptStatus::Loaded, ScriptStatus::Running, ScriptStatus::Finished]
        );
        let progress = sent
            .iter()
            .filter(|c| matches!(c, Command::UpdateScriptProgress { .. }))
            .count();
        assert_eq!(progress, 3);
        assert!(sent.contains(&Command::ShowMessage { text: "hi".into(), details: None }));
        assert!(sent.contains(&Command::SetAcquisitionOn { value: false }));
        assert!(!sent.iter().any(|c| matches!(c, Command::Sleep { .. })));
    }

    #[test]
    fn test_invalid_script_rejected() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, router_end, _buffers) =
            harness_with(Role::Scripting, &config, registry(), &[]);
        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut manager = ScriptManager::new();

        // Nobody handles MoveFocus in this run
        manager.load(&ctx, vec![ScriptStep::new(Command::MoveFocus { dz: 1.0 })]);
        assert_eq!(manager.status(), ScriptStatus::Error);
        let sent = drain(&router_end);
        assert!(sent.iter().any(|c| matches!(c, Command::ShowError { .. })));

        // Registered but not script-eligible
        manager.load(&ctx, vec![ScriptStep::new(Command::Quit)]);
        assert_eq!(manager.status(), ScriptStatus::Error);

        // Starting without a valid script does nothing
        manager.on_start_script(&mut ctx, Command::StartScript).unwrap();
        manager.tick(&mut ctx, 0.0).unwrap();
        assert_eq!(manager.status(), ScriptStatus::Error);
        assert_eq!(manager.position(), 0);
    }

    #[test]
    fn test_pause_resume_and_load_while_running() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, _router_end, _buffers) =
            harness_with(Role::Scripting, &config, registry(), &[]);
        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut manager = ScriptManager::new();

        let steps = vec![
            ScriptStep::new(Command::ShowMessage { text: "a".into(), details: None }),
            ScriptStep::new(Command::ShowMessage { text: "b".into(), details: None }),
        ];
        manager.load(&ctx, steps.clone());
        manager.on_start_script(&mut ctx, Command::StartScript).unwrap();
        manager.tick(&mut ctx, 0.0).unwrap();

        manager.load(&ctx, Vec::new());
        assert_eq!(manager.status(), ScriptStatus::Running);

        manager.on_pause_script(&mut ctx, Command::PauseScript).unwrap();
        manager.tick(&mut ctx, 0.1).unwrap();
        assert_eq!(manager.position(), 1);
        manager.on_resume_script(&mut ctx, Command::ResumeScript).unwrap();
        manager.tick(&mut ctx, 0.2).unwrap();
        assert_eq!(manager.status(), ScriptStatus::Finished);

        // A finished script can be started again from the top
        manager.on_start_script(&mut ctx, Command::StartScript).unwrap();
        assert_eq!(manager.position(), 0);
        assert_eq!(manager.status(), ScriptStatus::Running);
    }
}
