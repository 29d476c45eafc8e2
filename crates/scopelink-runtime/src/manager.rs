// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Manager lifecycle
//!
//! ```text
//! CREATED ──configure_shared_resources──▶ setup ──▶ RUNNING ──Quit──▶ QUITTING ──teardown──▶ STOPPED
//!                                                     │  ▲
//!                                        do_main_loop │  │ drain commands (non-blocking)
//!                                                     ▼  │
//! ```
//!
//! A [`ManagerProcess`] implements one role. The [`ManagerRunner`] hosts it on
//! one thread: it owns the [`ManagerContext`], alternates a bounded unit of
//! work with a non-blocking command drain, and executes every command
//! synchronously through the manager's [`HandlerTable`]. Errors and panics
//! from the loop or a handler are reported as `LogException` and the loop
//! continues.

use scopelink_buffers::{ExclusiveLock, MatrixBuffer, OverflowPolicy, PoolFlag, VideoBuffer};
use scopelink_config::ScopeConfig;
use scopelink_ipc::{
    AcquisitionMode, BeadRoi, Command, CommandKind, CommandRegistry, Envelope, IpcError, ManagerEnd,
    Role,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};
use crate::process::KillSwitch;
use crate::resources::{overflow_policy, BufferHandles, BufferRequest, SharedResources};

/// Command handler bound to a manager type
pub type Handler<M> = fn(&mut M, &mut ManagerContext, Command) -> Result<()>;

struct HandlerEntry<M> {
    kind: CommandKind,
    name: &'static str,
    handler: Handler<M>,
}

/// Static table of the commands a manager handles
pub struct HandlerTable<M> {
    entries: Vec<HandlerEntry<M>>,
}

impl<M> Default for HandlerTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> HandlerTable<M> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add a handler for `kind`
    pub fn on(mut self, kind: CommandKind, name: &'static str, handler: Handler<M>) -> Self {
        self.entries.push(HandlerEntry { kind, name, handler });
        self
    }

    pub fn get(&self, kind: CommandKind) -> Option<Handler<M>> {
        self.entries.iter().find(|e| e.kind == kind).map(|e| e.handler)
    }

    /// `(kind, handler name)` pairs for the command registry
    pub fn registrations(&self) -> Vec<(CommandKind, &'static str)> {
        self.entries.iter().map(|e| (e.kind, e.name)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Published manager state, monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ManagerState {
    Created = 0,
    Running = 1,
    Quitting = 2,
    Stopped = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Quitting,
            _ => Self::Stopped,
        }
    }
}

/// Lock-free view of a manager's state shared with the orchestrator
#[derive(Debug)]
pub struct ManagerStatus {
    state: AtomicU8,
}

impl Default for ManagerStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ManagerState::Created as u8),
        }
    }
}

impl ManagerStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance to `state`; never moves backwards
    pub fn advance(&self, state: ManagerState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == ManagerState::Stopped
    }

    /// Poll until `state` is reached or `timeout` passes
    pub fn wait_for(&self, state: ManagerState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.get() < state {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Acquisition state every manager mirrors from broadcasts
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionState {
    pub on: bool,
    pub dir: Option<String>,
    pub dir_on: bool,
    pub mode: AcquisitionMode,
    pub bead_rois: BTreeMap<u32, BeadRoi>,
}

impl Default for AcquisitionState {
    fn default() -> Self {
        Self {
            on: true,
            dir: None,
            dir_on: false,
            mode: AcquisitionMode::default(),
            bead_rois: BTreeMap::new(),
        }
    }
}

/// A manager's view of the run, owned by its loop thread
pub struct ManagerContext {
    role: Role,
    channel: ManagerEnd,
    handles: BufferHandles,
    config: Arc<ScopeConfig>,
    status: Arc<ManagerStatus>,
    acquisition: AcquisitionState,
    quitting: bool,
    /// Quit arrived from elsewhere, so it must not be re-broadcast
    quit_received: bool,
}

impl ManagerContext {
    pub fn new(resources: SharedResources, status: Arc<ManagerStatus>) -> Self {
        Self {
            role: resources.role,
            channel: resources.channel,
            handles: resources.handles,
            config: resources.config,
            status,
            acquisition: AcquisitionState::default(),
            quitting: false,
            quit_received: false,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn handles(&self) -> &BufferHandles {
        &self.handles
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.channel.registry()
    }

    pub fn acquisition(&self) -> &AcquisitionState {
        &self.acquisition
    }

    /// Overflow policy for acquisition-path writes
    pub fn overflow_policy(&self) -> OverflowPolicy {
        overflow_policy(&self.config.buffers)
    }

    /// Seconds since the Unix epoch
    pub fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
    }

    /// Send a command; unregistered commands fail here
    pub fn send(&self, command: Command) -> Result<()> {
        Ok(self.channel.send(command)?)
    }

    /// Send a notification if anyone registered for it
    ///
    /// Returns whether it was sent. Unregistered notifications are only logged.
    pub fn notify(&self, command: Command) -> bool {
        let kind = command.kind();
        if !self.registry().is_registered(kind) {
            if is_alert(kind) {
                warn!("[MANAGER] {} raised {:?} but nobody registered for it", self.role, kind);
            } else {
                debug!("[MANAGER] {} notification {:?} has no receiver", self.role, kind);
            }
            return false;
        }
        match self.channel.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("[MANAGER] {} failed to send {:?}: {}", self.role, kind, e);
                false
            }
        }
    }

    /// Log an error and report it upstream as `LogException`
    pub fn report_error(&self, err: &dyn fmt::Display) {
        error!("[MANAGER] {}: {}", self.role, err);
        let report = Command::LogException {
            role: self.role.clone(),
            details: err.to_string(),
        };
        if let Err(e) = self.channel.send(report) {
            debug!("[MANAGER] {} could not report error: {}", self.role, e);
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    /// Stop after this iteration and ask every other manager to quit
    pub fn request_quit(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        self.status.advance(ManagerState::Quitting);
        if !self.quit_received {
            info!("[MANAGER] {} requested quit", self.role);
            if let Err(e) = self.channel.send(Command::Quit) {
                warn!("[MANAGER] {} could not broadcast quit: {}", self.role, e);
            }
        }
    }

    pub(crate) fn recv(&self) -> std::result::Result<Option<Envelope>, IpcError> {
        self.channel.try_recv()
    }

    /// Apply the runner's built-in broadcast handling; true if `command` was one
    pub(crate) fn apply_builtin(&mut self, command: &Command) -> bool {
        match command {
            Command::Quit => {
                self.quit_received = true;
                self.request_quit();
            }
            Command::SetAcquisitionOn { value } => self.acquisition.on = *value,
            Command::SetAcquisitionDir { value } => self.acquisition.dir = value.clone(),
            Command::SetAcquisitionDirOn { value } => self.acquisition.dir_on = *value,
            Command::SetAcquisitionMode { mode } => self.acquisition.mode = *mode,
            Command::SetBeadRois { rois } => self.acquisition.bead_rois = rois.clone(),
            Command::SetConfig { config } => self.config = Arc::new((**config).clone()),
            _ => return false,
        }
        true
    }

    fn close(&mut self) {
        self.quitting = true;
        self.status.advance(ManagerState::Quitting);
    }

    pub fn attach_video(&self) -> Result<VideoBuffer> {
        Ok(VideoBuffer::attach(&self.handles.video)?)
    }

    pub fn attach_tracks(&self) -> Result<MatrixBuffer> {
        Ok(MatrixBuffer::attach(&self.handles.tracks)?)
    }

    pub fn attach_pool_flag(&self) -> Result<PoolFlag> {
        Ok(PoolFlag::attach(&self.handles.pool_flag)?)
    }

    pub fn attach_gpu_lock(&self) -> Result<ExclusiveLock> {
        Ok(ExclusiveLock::attach(&self.handles.gpu_lock)?)
    }

    /// Attach a matrix buffer allocated from a [`BufferRequest`]
    pub fn attach_extra(&self, name: &str) -> Result<MatrixBuffer> {
        let handle = self
            .handles
            .extra
            .get(name)
            .ok_or_else(|| ManagerError::MissingResource(format!("buffer '{}'", name)))?;
        Ok(MatrixBuffer::attach(handle)?)
    }
}

/// One role's behaviour
///
/// Implementations hold their own state; the runner calls them from a
/// single thread, so nothing here needs interior locking.
pub trait ManagerProcess: Send + Sized + 'static {
    fn role(&self) -> Role;

    /// Commands this manager handles, beyond the runner built-ins
    fn handlers(&self) -> HandlerTable<Self>;

    /// Extra buffers the orchestrator must allocate before start
    fn buffer_requests(&self) -> Vec<BufferRequest> {
        Vec::new()
    }

    fn setup(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
        Ok(())
    }

    /// One bounded unit of work
    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()>;

    fn teardown(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
        Ok(())
    }
}

/// Object-safe face of a hosted manager, as the orchestrator sees it
///
/// Implemented by [`ManagerRunner`] for managers on an orchestrator thread
/// and by [`ProcessHost`](crate::process::ProcessHost) for managers in
/// their own OS process.
pub trait ManagerHost: Send {
    fn role(&self) -> Role;
    fn registrations(&self) -> Vec<(CommandKind, String)>;
    fn buffer_requests(&self) -> Vec<BufferRequest>;
    fn configure_shared_resources(&mut self, resources: SharedResources);
    fn status(&self) -> Arc<ManagerStatus>;
    /// Forced termination for a manager that ignores `Quit`; threads have none
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
    /// Run to completion on the calling thread
    fn run(self: Box<Self>);
}

/// Notifications that report lost data or a failed shutdown
fn is_alert(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::VideoBufferPurged | CommandKind::ShutdownTimedOut | CommandKind::ShowError
    )
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn guarded<T>(context: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ManagerError::Panicked {
            context: context.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Hosts one [`ManagerProcess`] on the current thread
pub struct ManagerRunner<M: ManagerProcess> {
    manager: M,
    handlers: HandlerTable<M>,
    resources: Option<SharedResources>,
    status: Arc<ManagerStatus>,
}

impl<M: ManagerProcess> ManagerRunner<M> {
    pub fn new(manager: M) -> Self {
        let handlers = manager.handlers();
        Self {
            manager,
            handlers,
            resources: None,
            status: ManagerStatus::new(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Run setup, the main loop and teardown; returns the stopped manager
    pub fn run_loop(mut self) -> M {
        let role = self.manager.role();
        let Some(resources) = self.resources.take() else {
            error!("[MANAGER] {} started without shared resources", role);
            self.status.advance(ManagerState::Stopped);
            return self.manager;
        };
        let mut ctx = ManagerContext::new(resources, Arc::clone(&self.status));
        let idle = Duration::from_millis(ctx.config().channels.idle_sleep_ms);

        let manager = &mut self.manager;
        if let Err(e) = guarded("setup", || manager.setup(&mut ctx)) {
            ctx.report_error(&e);
        }
        self.status.advance(ManagerState::Running);
        info!("[MANAGER] {} running", role);

        while !ctx.is_quitting() {
            let manager = &mut self.manager;
            if let Err(e) = guarded("main loop", || manager.do_main_loop(&mut ctx)) {
                ctx.report_error(&e);
            }
            let drained = self.drain(&mut ctx);
            if drained == 0 && !idle.is_zero() && !ctx.is_quitting() {
                thread::sleep(idle);
            }
        }

        self.status.advance(ManagerState::Quitting);
        let manager = &mut self.manager;
        if let Err(e) = guarded("teardown", || manager.teardown(&mut ctx)) {
            ctx.report_error(&e);
        }
        drop(ctx);
        info!("[MANAGER] {} stopped", role);
        self.status.advance(ManagerState::Stopped);
        self.manager
    }

    /// Execute every waiting command; stops early once quitting
    fn drain(&mut self, ctx: &mut ManagerContext) -> usize {
        let mut drained = 0;
        while !ctx.is_quitting() {
            match ctx.recv() {
                Ok(Some(envelope)) => {
                    drained += 1;
                    self.dispatch(ctx, envelope.payload);
                }
                Ok(None) => break,
                Err(IpcError::ChannelClosed(_)) => {
                    warn!("[MANAGER] {} lost its channel, stopping", ctx.role());
                    ctx.close();
                }
                Err(e) => {
                    drained += 1;
                    warn!("[MANAGER] {} dropped an inbound frame: {}", ctx.role(), e);
                }
            }
        }
        drained
    }

    fn dispatch(&mut self, ctx: &mut ManagerContext, command: Command) {
        let kind = command.kind();
        let builtin = ctx.apply_builtin(&command);
        match self.handlers.get(kind) {
            Some(handler) => {
                let manager = &mut self.manager;
                let context = format!("{:?} handler", kind);
                if let Err(e) = guarded(&context, || handler(manager, ctx, command)) {
                    ctx.report_error(&e);
                }
            }
            None if !builtin => {
                warn!("[MANAGER] {} has no handler for {:?}", ctx.role(), kind);
            }
            None => {}
        }
    }
}

impl<M: ManagerProcess> ManagerHost for ManagerRunner<M> {
    fn role(&self) -> Role {
        self.manager.role()
    }

    fn registrations(&self) -> Vec<(CommandKind, String)> {
        self.handlers
            .registrations()
            .into_iter()
            .map(|(kind, name)| (kind, name.to_string()))
            .collect()
    }

    fn buffer_requests(&self) -> Vec<BufferRequest> {
        self.manager.buffer_requests()
    }

    fn configure_shared_resources(&mut self, resources: SharedResources) {
        self.resources = Some(resources);
    }

    fn status(&self) -> Arc<ManagerStatus> {
        Arc::clone(&self.status)
    }

    fn run(self: Box<Self>) {
        self.run_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, small_config};
    use scopelink_ipc::{Delivery, Source};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Counter {
        iterations: usize,
        pings: usize,
        torn_down: bool,
        panic_once: bool,
    }

    impl Counter {
        fn on_show_message(&mut self, _ctx: &mut ManagerContext, command: Command) -> Result<()> {
            if let Command::ShowMessage { text, .. } = command {
                if text == "fail" {
                    return Err(ManagerError::Handler {
                        command: CommandKind::ShowMessage,
                        reason: "asked to fail".to_string(),
                    });
                }
                self.pings += 1;
            }
            Ok(())
        }
    }

    impl ManagerProcess for Counter {
        fn role(&self) -> Role {
            Role::Presentation
        }

        fn handlers(&self) -> HandlerTable<Self> {
            HandlerTable::new().on(CommandKind::ShowMessage, "show_message", Counter::on_show_message)
        }

        fn do_main_loop(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
            self.iterations += 1;
            if self.panic_once {
                self.panic_once = false;
                panic!("main loop exploded");
            }
            Ok(())
        }

        fn teardown(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
            self.torn_down = true;
            Ok(())
        }
    }

    fn envelope(command: Command) -> Envelope {
        let destination = match command.delivery_mode() {
            scopelink_ipc::DeliveryMode::Broadcast => Delivery::Broadcast,
            _ => Delivery::Direct(Role::Presentation),
        };
        Envelope::new(Source::Orchestrator, destination, command)
    }

    #[test]
    fn test_handler_table_lookup() {
        let table = Counter::default().handlers();
        assert_eq!(table.len(), 1);
        assert!(table.get(CommandKind::ShowMessage).is_some());
        assert!(table.get(CommandKind::Quit).is_none());
        assert_eq!(table.registrations(), vec![(CommandKind::ShowMessage, "show_message")]);
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let status = ManagerStatus::new();
        assert_eq!(status.get(), ManagerState::Created);
        status.advance(ManagerState::Quitting);
        status.advance(ManagerState::Running);
        assert_eq!(status.get(), ManagerState::Quitting);
        assert!(!status.wait_for(ManagerState::Stopped, Duration::from_millis(5)));
        status.advance(ManagerState::Stopped);
        assert!(status.is_stopped());
    }

    #[test]
    fn test_runner_survives_errors_and_stops_on_quit() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, router_end, _buffers) =
            harness(Role::Presentation, &config, &[(CommandKind::ShowMessage, "show_message")]);

        let mut runner = ManagerRunner::new(Counter {
            panic_once: true,
            ..Counter::default()
        });
        runner.configure_shared_resources(resources);
        let status = runner.status();

        router_end
            .deliver(&envelope(Command::ShowMessage { text: "fail".into(), details: None }))
            .unwrap();
        router_end
            .deliver(&envelope(Command::ShowMessage { text: "ping".into(), details: None }))
            .unwrap();
        router_end.deliver(&envelope(Command::SetAcquisitionOn { value: false })).unwrap();
        router_end.deliver(&envelope(Command::Quit)).unwrap();
        // Arrives after quit and is never executed
        router_end
            .deliver(&envelope(Command::ShowMessage { text: "late".into(), details: None }))
            .unwrap();

        let manager = runner.run_loop();
        assert!(status.is_stopped());
        assert!(manager.torn_down);
        assert_eq!(manager.pings, 1);
        // Everything was queued before start, so one pass drained it all
        assert_eq!(manager.iterations, 1);

        // Panic and handler failure were both reported; quit came from outside so no echo
        let mut exceptions = 0;
        let mut quits = 0;
        while let Ok(Some(sent)) = router_end.try_recv() {
            match sent.payload {
                Command::LogException { role, .. } => {
                    assert_eq!(role, Role::Presentation);
                    exceptions += 1;
                }
                Command::Quit => quits += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(exceptions, 2);
        assert_eq!(quits, 0);
    }

    #[test]
    fn test_request_quit_broadcasts_once() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, router_end, _buffers) = harness(Role::Camera, &config, &[]);
        let status = ManagerStatus::new();
        let mut ctx = ManagerContext::new(resources, Arc::clone(&status));

        ctx.request_quit();
        ctx.request_quit();
        assert!(ctx.is_quitting());
        assert_eq!(status.get(), ManagerState::Quitting);
        assert_eq!(router_end.try_recv().unwrap().unwrap().payload, Command::Quit);
        assert_eq!(router_end.try_recv().unwrap(), None);
    }

    #[test]
    fn test_builtins_update_context() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, _router_end, _buffers) = harness(Role::Camera, &config, &[]);
        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());

        assert!(ctx.acquisition().on);
        assert!(ctx.apply_builtin(&Command::SetAcquisitionOn { value: false }));
        assert!(ctx.apply_builtin(&Command::SetAcquisitionMode { mode: AcquisitionMode::FullVideo }));
        let mut rois = BTreeMap::new();
        rois.insert(7, BeadRoi::new(0, 26, 0, 26));
        assert!(ctx.apply_builtin(&Command::SetBeadRois { rois }));
        let mut updated = ctx.config().clone();
        updated.xy_lock.max_step = 42.0;
        assert!(ctx.apply_builtin(&Command::SetConfig { config: Box::new(updated) }));
        assert!(!ctx.apply_builtin(&Command::FocusMoveCompleted));

        assert!(!ctx.acquisition().on);
        assert_eq!(ctx.acquisition().mode, AcquisitionMode::FullVideo);
        assert_eq!(ctx.acquisition().bead_rois.len(), 1);
        assert_eq!(ctx.config().xy_lock.max_step, 42.0);
        assert!(!ctx.is_quitting());
    }

    #[test]
    fn test_notify_skips_unregistered_kinds() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let (resources, router_end, _buffers) = harness(Role::Camera, &config, &[]);
        let ctx = ManagerContext::new(resources, ManagerStatus::new());

        assert!(!ctx.notify(Command::VideoBufferPurged { at: 1.0 }));
        assert!(matches!(
            ctx.send(Command::VideoBufferPurged { at: 1.0 }),
            Err(ManagerError::Ipc(IpcError::UnregisteredCommand(_)))
        ));
        assert_eq!(router_end.try_recv().unwrap(), None);
        assert!(ctx.attach_extra("missing").is_err());
        assert!(is_alert(CommandKind::VideoBufferPurged));
        assert!(is_alert(CommandKind::ShutdownTimedOut));
        assert!(!is_alert(CommandKind::CameraSettingChanged));
        assert!(ctx.attach_video().is_ok());
    }
}
