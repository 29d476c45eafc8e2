// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Orchestrator
//!
//! ```text
//! CREATED ──start──▶ RUNNING ──stop──▶ QUITTING ──▶ STOPPED
//! ```
//!
//! `start` builds the command registry from every manager's handler table,
//! allocates the shared buffers, hands each manager its resources, starts
//! the router thread and then one host thread per manager. A host either
//! runs its manager in-thread ([`Orchestrator::add_manager`]) or supervises
//! an OS process ([`Orchestrator::add_process`]). `stop` broadcasts `Quit`,
//! waits for the managers up to the configured timeout, kills manager
//! processes that are still running, stops the router and unlinks the
//! buffers. An orchestrator runs once.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use scopelink_config::{validate_config, ScopeConfig};
use scopelink_ipc::{
    duplex, Command, CommandKind, CommandRegistry, Envelope, ManagerEnd, Role, Router, RouterStats,
    RUNNER_HANDLER,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::manager::{ManagerProcess, ManagerState, ManagerStatus};
use crate::process::{KillSwitch, ProcessHost, ProcessSpec};
use crate::resources::{new_run_id, BufferRequest, SharedBuffers, SharedResources};
use crate::roles::RoleRegistry;

/// Handler name recorded for kinds the presentation endpoint receives
pub const PRESENTATION_HANDLER: &str = "presentation";

/// Idle polls in a row that end the router's final drain
const FINAL_DRAIN_IDLE_POLLS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrchestratorState {
    Created,
    Running,
    Quitting,
    Stopped,
}

/// Outcome of [`Orchestrator::stop`]
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    /// Managers still running when the timeout expired
    pub late: Vec<Role>,
    /// Late manager processes that had to be killed
    pub killed: Vec<Role>,
    pub router: RouterStats,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.late.is_empty()
    }

    pub fn ensure_clean(&self) -> OrchestratorResult<()> {
        if self.late.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::ShutdownTimeout {
                roles: self.late.clone(),
            })
        }
    }
}

struct ManagerThread {
    role: Role,
    status: Arc<ManagerStatus>,
    /// Set for managers hosted in their own process
    kill: Option<KillSwitch>,
    handle: Option<JoinHandle<()>>,
}

struct RouterThread {
    control: Sender<Command>,
    shutdown: Arc<AtomicBool>,
    quit_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<RouterStats>>,
}

pub struct Orchestrator {
    config: Arc<ScopeConfig>,
    roles: RoleRegistry,
    presentation_kinds: Option<Vec<CommandKind>>,
    state: OrchestratorState,
    registry: Option<Arc<CommandRegistry>>,
    buffers: Option<SharedBuffers>,
    threads: Vec<ManagerThread>,
    router: Option<RouterThread>,
    presentation: Option<ManagerEnd>,
    diagnostics: Arc<Mutex<Vec<Command>>>,
    link_context: Option<zmq::Context>,
}

impl Orchestrator {
    pub fn new(config: ScopeConfig) -> OrchestratorResult<Self> {
        validate_config(&config).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            roles: RoleRegistry::new(),
            presentation_kinds: None,
            state: OrchestratorState::Created,
            registry: None,
            buffers: None,
            threads: Vec::new(),
            router: None,
            presentation: None,
            diagnostics: Arc::new(Mutex::new(Vec::new())),
            link_context: None,
        })
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Host `manager`; returns false when its role is disabled
    pub fn add_manager<M: ManagerProcess>(&mut self, manager: M) -> OrchestratorResult<bool> {
        if self.state != OrchestratorState::Created {
            return Err(OrchestratorError::AlreadyRunning);
        }
        self.roles.add(manager, &self.config.roles)
    }

    /// Spawn the process `spec` describes and host the manager it serves
    ///
    /// Returns false, without spawning, when the role is disabled. The
    /// process must announce itself within `processes.handshake_timeout_ms`.
    pub fn add_process(&mut self, spec: ProcessSpec) -> OrchestratorResult<bool> {
        if self.state != OrchestratorState::Created {
            return Err(OrchestratorError::AlreadyRunning);
        }
        if !self.roles.admits(&spec.role, &self.config.roles)? {
            return Ok(false);
        }
        let context = self.link_context.get_or_insert_with(zmq::Context::new);
        let host = ProcessHost::launch(&spec, context, &self.config).map_err(|e| OrchestratorError::Spawn {
            role: spec.role.to_string(),
            reason: e.to_string(),
        })?;
        info!("[ORCHESTRATOR] Hosting {} in process {}", spec.role, host.pid());
        self.roles.add_host(Box::new(host), &self.config.roles)
    }

    /// Open a presentation endpoint that handles `kinds`
    ///
    /// The endpoint is an ordinary channel pair the embedding application
    /// drives itself; take it with [`Orchestrator::take_presentation`].
    pub fn enable_presentation(&mut self, kinds: &[CommandKind]) -> OrchestratorResult<()> {
        if self.state != OrchestratorState::Created {
            return Err(OrchestratorError::AlreadyRunning);
        }
        self.presentation_kinds = Some(kinds.to_vec());
        Ok(())
    }

    pub fn roles(&self) -> Vec<Role> {
        if self.threads.is_empty() {
            self.roles.roles()
        } else {
            self.threads.iter().map(|t| t.role.clone()).collect()
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn manager_state(&self, role: &Role) -> Option<ManagerState> {
        if let Some(thread) = self.threads.iter().find(|t| &t.role == role) {
            return Some(thread.status.get());
        }
        self.roles
            .hosts()
            .find(|host| &host.role() == role)
            .map(|host| host.status().get())
    }

    /// Registry built by `start`
    pub fn registry(&self) -> Option<&CommandRegistry> {
        self.registry.as_deref()
    }

    pub fn buffers(&self) -> Option<&SharedBuffers> {
        self.buffers.as_ref()
    }

    pub fn take_presentation(&mut self) -> Option<ManagerEnd> {
        self.presentation.take()
    }

    /// `LogException` and `TaskFailed` reports received so far
    pub fn diagnostics(&self) -> Vec<Command> {
        self.diagnostics.lock().clone()
    }

    /// Whether any party has broadcast `Quit`
    pub fn quit_requested(&self) -> bool {
        self.router
            .as_ref()
            .map_or(false, |r| r.quit_flag.load(Ordering::Acquire))
    }

    pub fn start(&mut self) -> OrchestratorResult<()> {
        match self.state {
            OrchestratorState::Created => {}
            OrchestratorState::Running | OrchestratorState::Quitting => {
                return Err(OrchestratorError::AlreadyRunning)
            }
            OrchestratorState::Stopped => return Err(OrchestratorError::AlreadyTerminated),
        }

        let registry = Arc::new(self.build_registry()?);
        let requests: Vec<BufferRequest> = self
            .roles
            .hosts()
            .flat_map(|host| host.buffer_requests())
            .collect();
        let run_id = new_run_id();
        let buffers = SharedBuffers::allocate(&self.config, &run_id, &requests).map_err(|e| match e {
            crate::error::ManagerError::Buffer(e) => OrchestratorError::Buffer(e),
            other => OrchestratorError::Config(other.to_string()),
        })?;

        let capacity = self.config.channels.capacity;
        let mut router = Router::new(Arc::clone(&registry)).with_backlog_limit(self.config.channels.backlog_limit);
        for host in self.roles.hosts_mut() {
            let role = host.role();
            let (manager_end, router_end) = duplex(role.clone(), capacity, Arc::clone(&registry));
            router.add_link(router_end);
            host.configure_shared_resources(SharedResources::new(
                role,
                buffers.handles().clone(),
                Arc::clone(&self.config),
                manager_end,
            ));
        }
        if self.presentation_kinds.is_some() {
            let (manager_end, router_end) = duplex(Role::Presentation, capacity, Arc::clone(&registry));
            router.add_link(router_end);
            self.presentation = Some(manager_end);
        }

        info!(
            "[ORCHESTRATOR] Starting run {} with {} manager(s), {} command kind(s)",
            run_id,
            self.roles.len(),
            registry.len()
        );
        self.router = Some(self.spawn_router(router, Arc::clone(&registry))?);
        self.registry = Some(registry);
        self.buffers = Some(buffers);
        self.state = OrchestratorState::Running;

        for host in self.roles.take_hosts() {
            let role = host.role();
            let status = host.status();
            let kill = host.kill_switch();
            let spawned = thread::Builder::new()
                .name(role.thread_name())
                .spawn(move || host.run());
            match spawned {
                Ok(handle) => self.threads.push(ManagerThread {
                    role,
                    status,
                    kill,
                    handle: Some(handle),
                }),
                Err(e) => {
                    error!("[ORCHESTRATOR] Failed to spawn {}: {}", role, e);
                    if let Err(stop_err) = self.stop() {
                        warn!("[ORCHESTRATOR] Cleanup after failed start: {}", stop_err);
                    }
                    return Err(OrchestratorError::Spawn {
                        role: role.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Route `command` as if the orchestrator sent it
    pub fn send(&self, command: Command) -> OrchestratorResult<()> {
        let (Some(router), Some(registry)) = (&self.router, &self.registry) else {
            return Err(OrchestratorError::NotRunning);
        };
        registry.resolve(command.kind())?;
        router
            .control
            .send(command)
            .map_err(|_| OrchestratorError::NotRunning)
    }

    /// Block until someone requests quit, every manager has stopped, or
    /// `timeout` passes; returns whether the run is ending
    pub fn wait_for_quit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.quit_requested() || self.threads.iter().all(|t| t.status.is_stopped()) {
                return true;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Start, wait for a quit request, then stop
    pub fn run(&mut self) -> OrchestratorResult<ShutdownReport> {
        self.start()?;
        self.wait_for_quit(None);
        self.stop()
    }

    pub fn stop(&mut self) -> OrchestratorResult<ShutdownReport> {
        match self.state {
            OrchestratorState::Running => {}
            OrchestratorState::Stopped => return Err(OrchestratorError::AlreadyTerminated),
            _ => return Err(OrchestratorError::NotRunning),
        }
        self.state = OrchestratorState::Quitting;
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.shutdown.timeout_ms);

        if let Some(router) = &self.router {
            if router.control.send(Command::Quit).is_err() {
                warn!("[ORCHESTRATOR] Router gone before quit could be sent");
            }
        }

        let deadline = started + timeout;
        for thread in &self.threads {
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread.status.wait_for(ManagerState::Stopped, remaining);
        }
        let late: Vec<Role> = self
            .threads
            .iter()
            .filter(|t| !t.status.is_stopped())
            .map(|t| t.role.clone())
            .collect();
        if !late.is_empty() {
            error!(
                "[ORCHESTRATOR] {} manager(s) did not stop within {:?}: {:?}",
                late.len(),
                timeout,
                late
            );
            if let Some(router) = &self.router {
                let notice = Command::ShutdownTimedOut { roles: late.clone() };
                if router.control.send(notice).is_err() {
                    debug!("[ORCHESTRATOR] Could not report shutdown timeout");
                }
            }
        }

        let killed = self.kill_late_processes();

        for thread in &mut self.threads {
            let Some(handle) = thread.handle.take() else {
                continue;
            };
            if thread.status.is_stopped() {
                if handle.join().is_err() {
                    warn!("[ORCHESTRATOR] {} thread panicked", thread.role);
                }
            } else {
                warn!("[ORCHESTRATOR] Leaving {} behind; its thread ends once its loop returns", thread.role);
                drop(handle);
            }
        }

        let router_stats = self.stop_router();
        if let Some(buffers) = self.buffers.take() {
            buffers.unlink_all();
        }
        self.presentation = None;
        self.state = OrchestratorState::Stopped;

        let report = ShutdownReport {
            late,
            killed,
            router: router_stats,
            elapsed: started.elapsed(),
        };
        info!(
            "[ORCHESTRATOR] Stopped in {:?} ({} routed, {} broadcast, {} dropped)",
            report.elapsed, report.router.routed, report.router.broadcasts, report.router.dropped
        );
        Ok(report)
    }

    /// Kill manager processes that missed the shutdown timeout and wait
    /// for their hosts to notice
    fn kill_late_processes(&self) -> Vec<Role> {
        let killed: Vec<&ManagerThread> = self
            .threads
            .iter()
            .filter(|t| !t.status.is_stopped())
            .filter(|t| t.kill.as_ref().map_or(false, |k| k.kill()))
            .collect();
        if killed.is_empty() {
            return Vec::new();
        }
        let grace = Duration::from_millis(self.config.processes.kill_timeout_ms);
        let deadline = Instant::now() + grace;
        for thread in &killed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !thread.status.wait_for(ManagerState::Stopped, remaining) {
                error!("[ORCHESTRATOR] {} still not stopped {:?} after the kill", thread.role, grace);
            }
        }
        killed.iter().map(|t| t.role.clone()).collect()
    }

    fn build_registry(&self) -> OrchestratorResult<CommandRegistry> {
        let mut registry = CommandRegistry::new();
        for host in self.roles.hosts() {
            let role = host.role();
            registry.register_all(&role, CommandKind::BROADCAST.iter().map(|k| (*k, RUNNER_HANDLER)))?;
            registry.register_all(&role, host.registrations())?;
        }
        if let Some(kinds) = &self.presentation_kinds {
            registry.register_all(
                &Role::Presentation,
                kinds.iter().map(|k| (*k, PRESENTATION_HANDLER)),
            )?;
        }
        Ok(registry)
    }

    fn spawn_router(&self, router: Router, registry: Arc<CommandRegistry>) -> OrchestratorResult<RouterThread> {
        let (control_tx, control_rx) = channel::unbounded();
        let mut router = router.with_control(control_rx);
        let quit_flag = router.quit_flag();
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll = Duration::from_millis(self.config.channels.router_poll_ms);
        let diagnostics = Arc::clone(&self.diagnostics);

        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("scopelink-router".to_string())
            .spawn(move || {
                let mut local = move |envelope: &Envelope| diagnose(envelope, &registry, &diagnostics);
                while !stop.load(Ordering::Acquire) {
                    router.poll(poll, &mut local);
                }
                let mut idle = 0;
                while idle < FINAL_DRAIN_IDLE_POLLS {
                    if router.poll(Duration::ZERO, &mut local) == 0 {
                        idle += 1;
                    } else {
                        idle = 0;
                    }
                }
                router.stats()
            })
            .map_err(|e| OrchestratorError::Spawn {
                role: "router".to_string(),
                reason: e.to_string(),
            })?;

        Ok(RouterThread {
            control: control_tx,
            shutdown,
            quit_flag,
            handle: Some(handle),
        })
    }

    fn stop_router(&mut self) -> RouterStats {
        let Some(mut router) = self.router.take() else {
            return RouterStats::default();
        };
        router.shutdown.store(true, Ordering::Release);
        match router.handle.take().map(|h| h.join()) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                error!("[ORCHESTRATOR] Router thread panicked");
                RouterStats::default()
            }
            None => RouterStats::default(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.state == OrchestratorState::Running {
            if let Err(e) = self.stop() {
                warn!("[ORCHESTRATOR] Stop on drop failed: {}", e);
            }
        }
    }
}

/// Local handling of diagnostics reports
fn diagnose(
    envelope: &Envelope,
    registry: &CommandRegistry,
    diagnostics: &Mutex<Vec<Command>>,
) -> Vec<Command> {
    let (text, details) = match &envelope.payload {
        Command::LogException { role, details } => {
            error!("[ORCHESTRATOR] Exception in {}: {}", role, details);
            (format!("Error in {}", role), details.clone())
        }
        Command::TaskFailed { task, details } => {
            warn!("[ORCHESTRATOR] Task {} failed: {}", task, details);
            (format!("Task {} failed", task), details.clone())
        }
        other => {
            debug!("[ORCHESTRATOR] Ignoring local {:?}", other.kind());
            return Vec::new();
        }
    };
    diagnostics.lock().push(envelope.payload.clone());
    if registry.is_registered(CommandKind::ShowError) {
        vec![Command::ShowError {
            text,
            details: Some(details),
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::manager::{HandlerTable, ManagerContext};
    use crate::test_support::small_config;
    use tempfile::tempdir;

    struct Noop(Role);

    impl ManagerProcess for Noop {
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

    struct Failing;

    impl ManagerProcess for Failing {
        fn role(&self) -> Role {
            Role::Scripting
        }

        fn handlers(&self) -> HandlerTable<Self> {
            HandlerTable::new()
        }

        fn setup(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
            Err(crate::error::ManagerError::Script("no script directory".to_string()))
        }

        fn do_main_loop(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.pool.workers = 0;
        assert!(matches!(
            Orchestrator::new(config),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_start_stop_once() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(small_config(dir.path())).unwrap();
        orchestrator.add_manager(Noop(Role::Camera)).unwrap();
        orchestrator.add_manager(Noop(Role::LockController)).unwrap();
        assert_eq!(orchestrator.manager_state(&Role::Camera), Some(ManagerState::Created));

        orchestrator.start().unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::AlreadyRunning)));
        assert!(matches!(
            orchestrator.add_manager(Noop(Role::Scripting)),
            Err(OrchestratorError::AlreadyRunning)
        ));

        let report = orchestrator.stop().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.router.broadcasts, 1);
        assert_eq!(orchestrator.manager_state(&Role::Camera), Some(ManagerState::Stopped));
        assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
        assert!(matches!(orchestrator.start(), Err(OrchestratorError::AlreadyTerminated)));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_manager_errors_reach_presentation() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(small_config(dir.path())).unwrap();
        orchestrator.add_manager(Failing).unwrap();
        orchestrator
            .enable_presentation(&[CommandKind::ShowError, CommandKind::ShutdownTimedOut])
            .unwrap();
        orchestrator.start().unwrap();
        let gui = orchestrator.take_presentation().unwrap();

        let envelope = gui.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        match envelope.payload {
            Command::ShowError { text, details } => {
                assert_eq!(text, "Error in scripting");
                assert!(details.unwrap().contains("no script directory"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(orchestrator.diagnostics().len(), 1);
        orchestrator.stop().unwrap().ensure_clean().unwrap();
    }

    #[test]
    fn test_manager_quit_is_observed() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(small_config(dir.path())).unwrap();
        orchestrator.add_manager(Noop(Role::Camera)).unwrap();
        orchestrator.enable_presentation(&[]).unwrap();
        orchestrator.start().unwrap();
        assert!(!orchestrator.wait_for_quit(Some(Duration::from_millis(20))));

        let gui = orchestrator.take_presentation().unwrap();
        gui.send(Command::Quit).unwrap();
        assert!(orchestrator.wait_for_quit(Some(Duration::from_secs(5))));
        let report = orchestrator.stop().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_send_requires_registration() {
        let dir = tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(small_config(dir.path())).unwrap();
        assert!(matches!(
            orchestrator.send(Command::Quit),
            Err(OrchestratorError::NotRunning)
        ));
        orchestrator.add_manager(Noop(Role::Camera)).unwrap();
        orchestrator.start().unwrap();
        assert!(matches!(
            orchestrator.send(Command::MoveFocus { dz: 1.0 }),
            Err(OrchestratorError::Registry(_))
        ));
        orchestrator.send(Command::SetAcquisitionOn { value: false }).unwrap();
        orchestrator.stop().unwrap();
    }
}
