// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Command router
//!
//! ```text
//!   camera ──┐                       ┌──▶ Outbox(camera)       ──▶ camera
//!   pool   ──┼──▶ Select (bounded) ──┼──▶ Outbox(worker_pool)  ──▶ pool
//!   lock   ──┤        │              ├──▶ Outbox(...)
//!   control ─┘        ▼              └──▶ LocalHandler (orchestrator)
//!                 registry.resolve
//! ```
//!
//! One [`Outbox`] per destination: frames that do not fit the destination's
//! bounded channel wait in that outbox's backlog, so a slow consumer only
//! delays itself. Per-destination order is preserved. A backlog holds at
//! most `backlog_limit` frames; past that the oldest frame is displaced.

use crossbeam::channel::{Receiver, Select, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::RouterEnd;
use crate::command::{Command, DeliveryMode};
use crate::registry::CommandRegistry;
use crate::role::Role;
use crate::wire::{Delivery, Envelope, Source};

/// Frames handled per `poll` after the first ready one
const DRAIN_BATCH: usize = 64;

/// Backlog cap when none is configured
pub const DEFAULT_BACKLOG_LIMIT: usize = 1024;

/// Executes commands whose delivery is [`Delivery::Local`]
///
/// Returned commands are routed onward as orchestrator-originated.
pub trait LocalHandler {
    fn handle_local(&mut self, envelope: &Envelope) -> Vec<Command>;
}

impl<F> LocalHandler for F
where
    F: FnMut(&Envelope) -> Vec<Command>,
{
    fn handle_local(&mut self, envelope: &Envelope) -> Vec<Command> {
        self(envelope)
    }
}

/// Outbound queue toward one destination
#[derive(Debug)]
pub struct Outbox {
    role: Role,
    tx: Sender<Vec<u8>>,
    backlog: VecDeque<Vec<u8>>,
    limit: usize,
    displaced: u64,
    closed: bool,
}

impl Outbox {
    fn new(role: Role, tx: Sender<Vec<u8>>, limit: usize) -> Self {
        Self {
            role,
            tx,
            backlog: VecDeque::new(),
            limit: limit.max(1),
            displaced: 0,
            closed: false,
        }
    }

    /// Queue a frame; false once the destination is gone
    fn push(&mut self, frame: Vec<u8>) -> bool {
        if self.closed {
            return false;
        }
        self.backlog.push_back(frame);
        self.flush();
        if self.backlog.len() > self.limit {
            let excess = self.backlog.len() - self.limit;
            self.backlog.drain(..excess);
            self.displaced += excess as u64;
            warn!(
                "[ROUTER] {} backlog over {} frame(s), dropped {} oldest ({} so far)",
                self.role, self.limit, excess, self.displaced
            );
        }
        !self.closed
    }

    fn flush(&mut self) {
        while let Some(frame) = self.backlog.pop_front() {
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    self.backlog.push_front(frame);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("[ROUTER] {} disconnected, dropping {} queued frame(s)", self.role, self.backlog.len() + 1);
                    self.backlog.clear();
                    self.closed = true;
                    break;
                }
            }
        }
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Frames dropped because the backlog was full
    pub fn displaced(&self) -> u64 {
        self.displaced
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

struct Link {
    role: Role,
    rx: Receiver<Vec<u8>>,
    inbound_open: bool,
    outbox: Outbox,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub broadcasts: u64,
    pub local: u64,
    /// Valid commands with no live destination, or work discarded after quit
    pub dropped: u64,
    /// Queued frames dropped from a full backlog
    pub displaced: u64,
    /// Frames that failed to decode or resolve
    pub rejected: u64,
}

enum Inbound {
    Frame(usize, Vec<u8>),
    LinkClosed(usize),
    Control(Command),
    ControlClosed,
    Idle,
}

pub struct Router {
    links: Vec<Link>,
    registry: Arc<CommandRegistry>,
    control: Option<Receiver<Command>>,
    quitting: Arc<AtomicBool>,
    backlog_limit: usize,
    stats: RouterStats,
}

impl Router {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            links: Vec::new(),
            registry,
            control: None,
            quitting: Arc::new(AtomicBool::new(false)),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            stats: RouterStats::default(),
        }
    }

    /// Cap every outbox backlog added after this call
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }

    /// Accept commands from the router host on `rx`
    pub fn with_control(mut self, rx: Receiver<Command>) -> Self {
        self.control = Some(rx);
        self
    }

    pub fn add_link(&mut self, end: RouterEnd) {
        let role = end.role().clone();
        self.links.push(Link {
            role: role.clone(),
            rx: end.receiver().clone(),
            inbound_open: true,
            outbox: Outbox::new(role, end.sender().clone(), self.backlog_limit),
        });
    }

    /// Set once a `Quit` has been routed
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quitting)
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            displaced: self.links.iter().map(|l| l.outbox.displaced()).sum(),
            ..self.stats
        }
    }

    pub fn roles(&self) -> Vec<Role> {
        self.links.iter().map(|l| l.role.clone()).collect()
    }

    /// Frames waiting in the backlog toward `role`
    pub fn backlog(&self, role: &Role) -> Option<usize> {
        self.links
            .iter()
            .find(|l| &l.role == role)
            .map(|l| l.outbox.backlog())
    }

    /// Whether any manager can still send
    pub fn has_open_links(&self) -> bool {
        self.links.iter().any(|l| l.inbound_open)
    }

    /// Wait at most `timeout` for traffic, then route everything ready
    ///
    /// Returns the number of inbound frames and control commands handled.
    pub fn poll(&mut self, timeout: Duration, local: &mut dyn LocalHandler) -> usize {
        self.flush_all();
        let mut handled = 0;
        match self.wait(timeout) {
            Inbound::Idle => return 0,
            inbound => {
                if self.handle_inbound(inbound, local) {
                    handled += 1;
                }
            }
        }
        for _ in 0..DRAIN_BATCH {
            match self.try_next() {
                Inbound::Idle => break,
                inbound => {
                    if self.handle_inbound(inbound, local) {
                        handled += 1;
                    }
                }
            }
        }
        self.flush_all();
        handled
    }

    /// Route a command on behalf of the router host
    pub fn dispatch(&mut self, command: Command, local: &mut dyn LocalHandler) {
        let kind = command.kind();
        let delivery = match self.registry.resolve(kind) {
            Ok(delivery) => delivery.clone(),
            Err(e) => {
                debug!("[ROUTER] Not routing orchestrator command: {}", e);
                self.stats.dropped += 1;
                return;
            }
        };
        let envelope = Envelope::new(Source::Orchestrator, delivery, command);
        match envelope.encode() {
            Ok(frame) => self.deliver(envelope, frame, local),
            Err(e) => {
                warn!("[ROUTER] Failed to encode {:?}: {}", kind, e);
                self.stats.rejected += 1;
            }
        }
    }

    fn wait(&self, timeout: Duration) -> Inbound {
        let mut sel = Select::new();
        let mut sources: Vec<Option<usize>> = Vec::new();
        for (i, link) in self.links.iter().enumerate() {
            if link.inbound_open {
                sel.recv(&link.rx);
                sources.push(Some(i));
            }
        }
        if let Some(control) = &self.control {
            sel.recv(control);
            sources.push(None);
        }
        if sources.is_empty() {
            std::thread::sleep(timeout);
            return Inbound::Idle;
        }

        let oper = match sel.select_timeout(timeout) {
            Ok(oper) => oper,
            Err(_) => return Inbound::Idle,
        };
        match sources[oper.index()] {
            Some(i) => match oper.recv(&self.links[i].rx) {
                Ok(frame) => Inbound::Frame(i, frame),
                Err(_) => Inbound::LinkClosed(i),
            },
            None => match self.control.as_ref().map(|c| oper.recv(c)) {
                Some(Ok(command)) => Inbound::Control(command),
                _ => Inbound::ControlClosed,
            },
        }
    }

    fn try_next(&self) -> Inbound {
        if let Some(control) = &self.control {
            if let Ok(command) = control.try_recv() {
                return Inbound::Control(command);
            }
        }
        for (i, link) in self.links.iter().enumerate() {
            if link.inbound_open {
                if let Ok(frame) = link.rx.try_recv() {
                    return Inbound::Frame(i, frame);
                }
            }
        }
        Inbound::Idle
    }

    fn handle_inbound(&mut self, inbound: Inbound, local: &mut dyn LocalHandler) -> bool {
        match inbound {
            Inbound::Frame(i, frame) => {
                self.route_frame(i, frame, local);
                true
            }
            Inbound::Control(command) => {
                self.dispatch(command, local);
                true
            }
            Inbound::LinkClosed(i) => {
                debug!("[ROUTER] {} closed its channel", self.links[i].role);
                self.links[i].inbound_open = false;
                false
            }
            Inbound::ControlClosed => {
                self.control = None;
                false
            }
            Inbound::Idle => false,
        }
    }

    fn route_frame(&mut self, link: usize, frame: Vec<u8>, local: &mut dyn LocalHandler) {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[ROUTER] Rejected frame from {}: {}", self.links[link].role, e);
                self.stats.rejected += 1;
                return;
            }
        };
        // The registry, not the sender, is authoritative for delivery
        match self.registry.resolve(envelope.payload.kind()) {
            Ok(delivery) if *delivery == envelope.destination => {}
            Ok(delivery) => {
                warn!(
                    "[ROUTER] {} addressed {:?} to {:?}, registry says {:?}",
                    envelope.source,
                    envelope.payload.kind(),
                    envelope.destination,
                    delivery
                );
                self.stats.rejected += 1;
                return;
            }
            Err(e) => {
                warn!("[ROUTER] Rejected frame from {}: {}", envelope.source, e);
                self.stats.rejected += 1;
                return;
            }
        }
        self.deliver(envelope, frame, local);
    }

    fn deliver(&mut self, envelope: Envelope, frame: Vec<u8>, local: &mut dyn LocalHandler) {
        let is_quit = envelope.payload == Command::Quit;
        // After quit only new work is refused; reports and broadcasts still flow
        if self.is_quitting()
            && matches!(envelope.destination, Delivery::Direct(_))
            && !envelope.payload.kind().is_notification()
            && envelope.source != Source::Orchestrator
        {
            debug!("[ROUTER] Quitting, dropped {:?} from {}", envelope.payload.kind(), envelope.source);
            self.stats.dropped += 1;
            return;
        }

        match &envelope.destination {
            Delivery::Direct(role) => {
                let delivered = match self.links.iter_mut().find(|l| &l.role == role) {
                    Some(link) => link.outbox.push(frame),
                    None => false,
                };
                if delivered {
                    self.stats.routed += 1;
                } else {
                    warn!(
                        "[ROUTER] No live {} manager for {:?} from {}",
                        role,
                        envelope.payload.kind(),
                        envelope.source
                    );
                    self.stats.dropped += 1;
                }
            }
            Delivery::Broadcast => {
                if is_quit && !self.quitting.swap(true, Ordering::AcqRel) {
                    info!("[ROUTER] Quit requested by {}", envelope.source);
                }
                for link in self.links.iter_mut() {
                    link.outbox.push(frame.clone());
                }
                self.stats.broadcasts += 1;
            }
            Delivery::Local => {
                self.stats.local += 1;
                for follow_up in local.handle_local(&envelope) {
                    if follow_up.delivery_mode() == DeliveryMode::Local {
                        warn!("[ROUTER] Ignoring local follow-up {:?}", follow_up.kind());
                        continue;
                    }
                    self.dispatch(follow_up, local);
                }
            }
        }
    }

    fn flush_all(&mut self) {
        for link in self.links.iter_mut() {
            link.outbox.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{duplex, ManagerEnd};
    use crate::command::CommandKind;
    use crate::registry::RUNNER_HANDLER;

    const TICK: Duration = Duration::from_millis(20);

    fn no_local() -> impl FnMut(&Envelope) -> Vec<Command> {
        |_: &Envelope| Vec::new()
    }

    fn setup(capacity: usize) -> (Router, ManagerEnd, ManagerEnd, ManagerEnd) {
        setup_with_limit(capacity, DEFAULT_BACKLOG_LIMIT)
    }

    fn setup_with_limit(capacity: usize, limit: usize) -> (Router, ManagerEnd, ManagerEnd, ManagerEnd) {
        let mut registry = CommandRegistry::new();
        for role in [Role::Camera, Role::LockController, Role::Presentation] {
            registry.register(role, CommandKind::Quit, RUNNER_HANDLER).unwrap();
        }
        registry
            .register(Role::Presentation, CommandKind::MoveBeads, "move_beads")
            .unwrap();
        registry
            .register(Role::Presentation, CommandKind::ShowError, "show_error")
            .unwrap();
        registry
            .register(Role::Presentation, CommandKind::VideoBufferPurged, "video_buffer_purged")
            .unwrap();
        registry
            .register(Role::Camera, CommandKind::GetCameraSetting, "get_camera_setting")
            .unwrap();
        let registry = Arc::new(registry);

        let mut router = Router::new(Arc::clone(&registry)).with_backlog_limit(limit);
        let (camera, camera_end) = duplex(Role::Camera, capacity, Arc::clone(&registry));
        let (lock, lock_end) = duplex(Role::LockController, capacity, Arc::clone(&registry));
        let (gui, gui_end) = duplex(Role::Presentation, capacity, registry);
        router.add_link(camera_end);
        router.add_link(lock_end);
        router.add_link(gui_end);
        (router, camera, lock, gui)
    }

    #[test]
    fn test_direct_reaches_only_destination() {
        let (mut router, camera, lock, gui) = setup(8);
        lock.send(Command::MoveBeads { moves: vec![] }).unwrap();
        assert_eq!(router.poll(TICK, &mut no_local()), 1);

        assert_eq!(gui.try_recv().unwrap().unwrap().payload, Command::MoveBeads { moves: vec![] });
        assert_eq!(camera.try_recv(), Ok(None));
        assert_eq!(lock.try_recv(), Ok(None));
        assert_eq!(router.stats().routed, 1);
    }

    #[test]
    fn test_broadcast_reaches_everyone_and_sets_quitting() {
        let (mut router, camera, lock, gui) = setup(8);
        camera.send(Command::Quit).unwrap();
        router.poll(TICK, &mut no_local());

        for end in [&camera, &lock, &gui] {
            assert_eq!(end.try_recv().unwrap().unwrap().payload, Command::Quit);
        }
        assert!(router.is_quitting());
        assert!(router.quit_flag().load(Ordering::Acquire));

        // Manager traffic after quit is discarded
        lock.send(Command::MoveBeads { moves: vec![] }).unwrap();
        router.poll(TICK, &mut no_local());
        assert_eq!(gui.try_recv(), Ok(None));
        assert_eq!(router.stats().dropped, 1);
    }

    #[test]
    fn test_reports_still_flow_after_quit() {
        let (mut router, camera, lock, gui) = setup(8);
        lock.send(Command::Quit).unwrap();
        router.poll(TICK, &mut no_local());
        assert_eq!(gui.try_recv().unwrap().unwrap().payload, Command::Quit);

        camera.send(Command::VideoBufferPurged { at: 1.0 }).unwrap();
        camera
            .send(Command::ShowError { text: "camera stalled".into(), details: None })
            .unwrap();
        lock.send(Command::MoveBeads { moves: vec![] }).unwrap();
        router.poll(TICK, &mut no_local());

        assert_eq!(gui.try_recv().unwrap().unwrap().payload, Command::VideoBufferPurged { at: 1.0 });
        assert!(matches!(
            gui.try_recv().unwrap().unwrap().payload,
            Command::ShowError { .. }
        ));
        assert_eq!(gui.try_recv(), Ok(None));
        assert_eq!(router.stats().dropped, 1);
    }

    #[test]
    fn test_backlog_drops_oldest_past_limit() {
        let (mut router, _camera, lock, gui) = setup_with_limit(2, 3);
        for i in 0..8 {
            lock.send(Command::MoveBeads {
                moves: vec![crate::command::BeadMove { bead_id: i, dx: 0.0, dy: 0.0 }],
            })
            .unwrap();
            router.poll(TICK, &mut no_local());
        }

        // Two fill the channel, three wait, three oldest waiting were displaced
        assert_eq!(router.backlog(&Role::Presentation), Some(3));
        assert_eq!(router.stats().displaced, 3);
        assert_eq!(router.stats().routed, 8);

        let mut ids = Vec::new();
        for _ in 0..10 {
            while let Ok(Some(envelope)) = gui.try_recv() {
                if let Command::MoveBeads { moves } = envelope.payload {
                    ids.push(moves[0].bead_id);
                }
            }
            router.poll(Duration::from_millis(1), &mut no_local());
        }
        assert_eq!(ids, vec![0, 1, 5, 6, 7]);
    }

    #[test]
    fn test_slow_consumer_does_not_stall_others() {
        let (mut router, camera, lock, gui) = setup(2);
        for _ in 0..5 {
            lock.send(Command::MoveBeads { moves: vec![] }).unwrap();
            router.poll(TICK, &mut no_local());
        }
        gui.send(Command::GetCameraSetting { name: "gain".into() }).unwrap();
        router.poll(TICK, &mut no_local());

        // Presentation never read: its backlog grows, camera still served
        assert_eq!(router.backlog(&Role::Presentation), Some(3));
        assert_eq!(
            camera.try_recv().unwrap().unwrap().payload,
            Command::GetCameraSetting { name: "gain".into() }
        );

        // Draining presentation releases the backlog in order
        let mut received = 0;
        for _ in 0..10 {
            while let Ok(Some(_)) = gui.try_recv() {
                received += 1;
            }
            router.poll(Duration::from_millis(1), &mut no_local());
        }
        assert_eq!(received, 5);
        assert_eq!(router.backlog(&Role::Presentation), Some(0));
    }

    #[test]
    fn test_local_commands_run_on_host_and_follow_ups_route() {
        let (mut router, camera, _lock, gui) = setup(8);
        let mut seen = Vec::new();
        let mut local = |envelope: &Envelope| {
            seen.push(envelope.payload.kind());
            vec![Command::ShowError { text: "camera failed".into(), details: None }]
        };
        camera
            .send(Command::LogException { role: Role::Camera, details: "boom".into() })
            .unwrap();
        router.poll(TICK, &mut local);

        assert_eq!(seen, vec![CommandKind::LogException]);
        let envelope = gui.try_recv().unwrap().unwrap();
        assert_eq!(envelope.source, Source::Orchestrator);
        assert!(matches!(envelope.payload, Command::ShowError { .. }));
    }

    #[test]
    fn test_control_channel_and_closed_links() {
        let (tx, rx) = crossbeam::channel::bounded(4);
        let (router, camera, lock, gui) = setup(8);
        let mut router = router.with_control(rx);

        drop(camera);
        tx.send(Command::Quit).unwrap();
        for _ in 0..3 {
            router.poll(TICK, &mut no_local());
        }
        assert_eq!(lock.try_recv().unwrap().unwrap().payload, Command::Quit);
        assert_eq!(gui.try_recv().unwrap().unwrap().payload, Command::Quit);
        assert!(router.is_quitting());

        drop(lock);
        drop(gui);
        for _ in 0..3 {
            router.poll(Duration::from_millis(1), &mut no_local());
        }
        assert!(!router.has_open_links());
    }

    #[test]
    fn test_per_destination_order_preserved() {
        let (mut router, _camera, lock, gui) = setup(64);
        for i in 0..20 {
            lock.send(Command::MoveBeads {
                moves: vec![crate::command::BeadMove { bead_id: i, dx: 0.0, dy: 0.0 }],
            })
            .unwrap();
        }
        while router.poll(TICK, &mut no_local()) > 0 {}
        for i in 0..20 {
            match gui.try_recv().unwrap().unwrap().payload {
                Command::MoveBeads { moves } => assert_eq!(moves[0].bead_id, i),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
