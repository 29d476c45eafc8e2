// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Manager processes
//!
//! ```text
//!   orchestrator                                      manager process
//!   add_process ── spawn (endpoint, role in env) ───▶ serve()
//!        │     ◀── Hello { role, registrations, buffer requests }
//!   start ─────── Bootstrap { config, handles, registry } ──▶ attach segments, run loop
//!        │     ◀── Status(Running | Quitting | Stopped)
//!   stop ──────── Quit envelope ──────────────────────▶ teardown, exit
//!        └─ kill once the shutdown timeout has expired
//! ```
//!
//! Control messages travel as bincode [`ControlMessage`]s in link control
//! frames; commands travel as ordinary envelope frames. Segments are never
//! copied: the manager maps them itself from the handles in `Bootstrap`.

use parking_lot::Mutex;
use scopelink_config::ScopeConfig;
use scopelink_ipc::{
    duplex, CommandKind, CommandRegistry, FramePipe, IpcError, LinkControl, LinkFrame, LinkPump,
    ProcessLink, Role, ENDPOINT_ENV, ROLE_ENV,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Child, Command as OsCommand};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{ManagerHost, ManagerProcess, ManagerRunner, ManagerState, ManagerStatus};
use crate::resources::{BufferHandles, BufferRequest, SharedResources};

/// How long frames a manager process sends just before exiting may linger
const CHILD_LINGER: Duration = Duration::from_millis(1000);
/// Supervisor poll interval
const SUPERVISE_POLL: Duration = Duration::from_millis(10);
/// Link wait while a manager process waits for its bootstrap
const BOOTSTRAP_POLL: Duration = Duration::from_millis(100);

/// Control-frame payloads between the orchestrator and a manager process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    Hello {
        role: Role,
        registrations: Vec<(CommandKind, String)>,
        buffer_requests: Vec<BufferRequest>,
        pid: u32,
    },
    Bootstrap {
        config: Box<ScopeConfig>,
        handles: BufferHandles,
        registry: CommandRegistry,
    },
    Status(ManagerState),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(IpcError::from)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes).map_err(IpcError::from)?)
    }

    fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Bootstrap { .. } => "bootstrap",
            ControlMessage::Status(_) => "status",
        }
    }
}

/// How to start the OS process hosting one role
///
/// The program must call [`serve`] with a manager for `role`. The endpoint
/// and role key are passed in `SCOPELINK_MANAGER_ENDPOINT` and
/// `SCOPELINK_MANAGER_ROLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(role: Role, program: impl Into<PathBuf>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Last-resort termination of a manager process
#[derive(Clone)]
pub struct KillSwitch {
    role: Role,
    child: Arc<Mutex<Child>>,
}

impl KillSwitch {
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Kill the process if it is still running; true when a kill was sent
    pub fn kill(&self) -> bool {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => match child.kill() {
                Ok(()) => {
                    warn!("[PROCESS] Killed {} (pid {})", self.role, child.id());
                    true
                }
                Err(e) => {
                    error!("[PROCESS] Could not kill {}: {}", self.role, e);
                    false
                }
            },
            Err(e) => {
                warn!("[PROCESS] Could not query {}: {}", self.role, e);
                false
            }
        }
    }
}

/// Orchestrator-side host of a manager running in its own OS process
pub struct ProcessHost {
    role: Role,
    registrations: Vec<(CommandKind, String)>,
    buffer_requests: Vec<BufferRequest>,
    child: Arc<Mutex<Child>>,
    link: Option<ProcessLink>,
    pipe: Option<FramePipe>,
    status: Arc<ManagerStatus>,
    /// Time allowed between a reported stop and the process exiting
    exit_grace: Duration,
}

impl ProcessHost {
    /// Spawn the process described by `spec` and wait for its hello
    ///
    /// The process is killed again if the handshake fails.
    pub fn launch(spec: &ProcessSpec, context: &zmq::Context, config: &ScopeConfig) -> Result<Self> {
        let link = ProcessLink::bind(context, &config.processes.bind_address)?;
        let child = OsCommand::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENDPOINT_ENV, link.endpoint())
            .env(ROLE_ENV, spec.role.config_key())
            .spawn()
            .map_err(|e| ManagerError::Spawn(format!("{} ({}): {}", spec.role, spec.program.display(), e)))?;
        info!("[PROCESS] Spawned {} as pid {}", spec.role, child.id());

        let mut host = Self {
            role: spec.role.clone(),
            registrations: Vec::new(),
            buffer_requests: Vec::new(),
            child: Arc::new(Mutex::new(child)),
            link: Some(link),
            pipe: None,
            status: ManagerStatus::new(),
            exit_grace: Duration::from_millis(config.processes.kill_timeout_ms),
        };
        let timeout = Duration::from_millis(config.processes.handshake_timeout_ms);
        let (role, registrations, buffer_requests) = host.await_hello(timeout)?;
        if role != spec.role {
            return Err(ManagerError::Process(format!(
                "process started for {} announced itself as {}",
                spec.role, role
            )));
        }
        host.registrations = registrations;
        host.buffer_requests = buffer_requests;
        Ok(host)
    }

    pub fn pid(&self) -> u32 {
        self.child.lock().id()
    }

    fn await_hello(&self, timeout: Duration) -> Result<(Role, Vec<(CommandKind, String)>, Vec<BufferRequest>)> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| ManagerError::MissingResource("process link".to_string()))?;
        let deadline = Instant::now() + timeout;
        loop {
            let exited = self
                .child
                .lock()
                .try_wait()
                .map_err(|e| ManagerError::Process(format!("{}: {}", self.role, e)))?;
            if let Some(exit) = exited {
                return Err(ManagerError::Process(format!(
                    "{} exited during the handshake ({})",
                    self.role, exit
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ManagerError::Process(format!(
                    "{} sent no hello within {:?}",
                    self.role, timeout
                )));
            }
            match link.recv_timeout(remaining.min(Duration::from_millis(50)))? {
                Some(LinkFrame::Control(body)) => match ControlMessage::decode(&body)? {
                    ControlMessage::Hello {
                        role,
                        registrations,
                        buffer_requests,
                        pid,
                    } => {
                        debug!(
                            "[PROCESS] Hello from {} (pid {}): {} handler(s), {} buffer request(s)",
                            role,
                            pid,
                            registrations.len(),
                            buffer_requests.len()
                        );
                        return Ok((role, registrations, buffer_requests));
                    }
                    other => warn!("[PROCESS] {} sent {} before hello", self.role, other.name()),
                },
                Some(LinkFrame::Envelope(_)) => warn!("[PROCESS] {} sent a command before hello", self.role),
                None => {}
            }
        }
    }

    fn switch(&self) -> KillSwitch {
        KillSwitch {
            role: self.role.clone(),
            child: Arc::clone(&self.child),
        }
    }

    /// Pump frames until the process exits
    fn supervise(&mut self) {
        let (Some(link), Some(pipe)) = (self.link.take(), self.pipe.take()) else {
            error!("[PROCESS] {} was never bootstrapped, killing it", self.role);
            self.switch().kill();
            self.status.advance(ManagerState::Stopped);
            return;
        };
        let mirror = StatusMirror {
            role: self.role.clone(),
            status: Arc::clone(&self.status),
        };
        let pump = match LinkPump::spawn(format!("{}-link", self.role.thread_name()), link, pipe, mirror) {
            Ok(pump) => pump,
            Err(e) => {
                error!("[PROCESS] No link pump for {}: {}", self.role, e);
                self.switch().kill();
                self.status.advance(ManagerState::Stopped);
                return;
            }
        };

        let mut stopped_at: Option<Instant> = None;
        loop {
            match self.child.lock().try_wait() {
                Ok(Some(exit)) if exit.success() => {
                    info!("[PROCESS] {} exited", self.role);
                    break;
                }
                Ok(Some(exit)) => {
                    warn!("[PROCESS] {} exited with {}", self.role, exit);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("[PROCESS] Lost track of {}: {}", self.role, e);
                    break;
                }
            }
            if self.status.is_stopped() {
                let since = *stopped_at.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.exit_grace {
                    warn!("[PROCESS] {} reported stopped but has not exited", self.role);
                    self.switch().kill();
                }
            }
            thread::sleep(SUPERVISE_POLL);
        }

        let stats = pump.stop();
        debug!(
            "[PROCESS] {} link closed ({} sent, {} received, {} dropped)",
            self.role, stats.sent, stats.received, stats.dropped
        );
        self.status.advance(ManagerState::Stopped);
    }
}

impl ManagerHost for ProcessHost {
    fn role(&self) -> Role {
        self.role.clone()
    }

    fn registrations(&self) -> Vec<(CommandKind, String)> {
        self.registrations.clone()
    }

    fn buffer_requests(&self) -> Vec<BufferRequest> {
        self.buffer_requests.clone()
    }

    fn configure_shared_resources(&mut self, resources: SharedResources) {
        let bootstrap = ControlMessage::Bootstrap {
            config: Box::new((*resources.config).clone()),
            handles: resources.handles.clone(),
            registry: resources.channel.registry().clone(),
        };
        let sent = bootstrap.encode().and_then(|body| match &self.link {
            Some(link) => Ok(link.send(&LinkFrame::Control(body))?),
            None => Err(ManagerError::MissingResource("process link".to_string())),
        });
        match sent {
            Ok(()) => self.pipe = Some(resources.channel.into_pipe()),
            Err(e) => error!("[PROCESS] Could not bootstrap {}: {}", self.role, e),
        }
    }

    fn status(&self) -> Arc<ManagerStatus> {
        Arc::clone(&self.status)
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        Some(self.switch())
    }

    fn run(self: Box<Self>) {
        let mut host = *self;
        host.supervise();
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            warn!("[PROCESS] {} still running as its host goes away, killing it", self.role);
            if let Err(e) = child.kill() {
                error!("[PROCESS] Could not kill {}: {}", self.role, e);
            } else if let Err(e) = child.wait() {
                debug!("[PROCESS] Could not reap {}: {}", self.role, e);
            }
        }
    }
}

/// Mirrors the state a manager process reports into its [`ManagerStatus`]
struct StatusMirror {
    role: Role,
    status: Arc<ManagerStatus>,
}

impl LinkControl for StatusMirror {
    fn on_control(&mut self, body: Vec<u8>) {
        match ControlMessage::decode(&body) {
            Ok(ControlMessage::Status(state)) => {
                debug!("[PROCESS] {} is {:?}", self.role, state);
                self.status.advance(state);
            }
            Ok(other) => warn!("[PROCESS] {} sent an unexpected {}", self.role, other.name()),
            Err(e) => warn!("[PROCESS] Bad control message from {}: {}", self.role, e),
        }
    }
}

/// Reports every state change of the local runner to the orchestrator
struct StatusReporter {
    status: Arc<ManagerStatus>,
    reported: Option<ManagerState>,
}

impl LinkControl for StatusReporter {
    fn on_control(&mut self, body: Vec<u8>) {
        match ControlMessage::decode(&body) {
            Ok(other) => debug!("[PROCESS] Ignoring {} from orchestrator", other.name()),
            Err(e) => warn!("[PROCESS] Bad control message from orchestrator: {}", e),
        }
    }

    fn poll_control(&mut self) -> Option<Vec<u8>> {
        let state = self.status.get();
        if self.reported == Some(state) {
            return None;
        }
        self.reported = Some(state);
        match ControlMessage::Status(state).encode() {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("[PROCESS] Could not encode status {:?}: {}", state, e);
                None
            }
        }
    }
}

/// Host `manager` for the orchestrator that spawned this process
///
/// Reads the endpoint from `SCOPELINK_MANAGER_ENDPOINT` and returns the
/// manager once its loop has stopped.
pub fn serve<M: ManagerProcess>(manager: M) -> Result<M> {
    let endpoint = std::env::var(ENDPOINT_ENV)
        .map_err(|_| ManagerError::MissingResource(format!("{} is not set", ENDPOINT_ENV)))?;
    serve_at(manager, &endpoint)
}

/// [`serve`] with an explicit endpoint
pub fn serve_at<M: ManagerProcess>(manager: M, endpoint: &str) -> Result<M> {
    let context = zmq::Context::new();
    let link = ProcessLink::connect(&context, endpoint, CHILD_LINGER)?;
    let mut runner = ManagerRunner::new(manager);
    let role = ManagerHost::role(&runner);

    let hello = ControlMessage::Hello {
        role: role.clone(),
        registrations: ManagerHost::registrations(&runner),
        buffer_requests: ManagerHost::buffer_requests(&runner),
        pid: std::process::id(),
    };
    link.send(&LinkFrame::Control(hello.encode()?))?;

    let (config, handles, registry) = await_bootstrap(&link, &role)?;
    info!("[PROCESS] {} bootstrapped, attaching run segments", role);
    let (manager_end, router_end) = duplex(role.clone(), config.channels.capacity, Arc::new(registry));
    runner.configure_shared_resources(SharedResources::new(
        role.clone(),
        handles,
        Arc::new(*config),
        manager_end,
    ));

    let reporter = StatusReporter {
        status: ManagerHost::status(&runner),
        reported: None,
    };
    let pump = LinkPump::spawn(format!("{}-link", role.thread_name()), link, router_end.into_pipe(), reporter)?;
    let manager = runner.run_loop();
    let stats = pump.stop();
    info!(
        "[PROCESS] {} finished ({} frame(s) sent, {} received)",
        role, stats.sent, stats.received
    );
    Ok(manager)
}

fn await_bootstrap(link: &ProcessLink, role: &Role) -> Result<(Box<ScopeConfig>, BufferHandles, CommandRegistry)> {
    loop {
        match link.recv_timeout(BOOTSTRAP_POLL)? {
            Some(LinkFrame::Control(body)) => match ControlMessage::decode(&body)? {
                ControlMessage::Bootstrap {
                    config,
                    handles,
                    registry,
                } => return Ok((config, handles, registry)),
                other => warn!("[PROCESS] {} got {} before bootstrap", role, other.name()),
            },
            Some(LinkFrame::Envelope(_)) => warn!("[PROCESS] {} got a command before bootstrap", role),
            None => {}
        }
    }
}
