// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process links
//!
//! ```text
//!   orchestrator process                                  manager process
//!   Router ─ RouterEnd ┄ ManagerEnd ─ LinkPump ══ PAIR ══ LinkPump ─ RouterEnd ┄ ManagerEnd ─ runner
//! ```
//!
//! A manager hosted in its own OS process talks to the router over one zmq
//! PAIR socket. Every zmq message is one [`LinkFrame`]: a tag byte followed
//! by an encoded envelope or by a control body whose meaning the hosts agree
//! on. A [`LinkPump`] thread on each side moves frames between the socket
//! and a [`FramePipe`], so the router and the manager runner only ever see
//! ordinary channels.

use crossbeam::channel::{TryRecvError, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channel::FramePipe;
use crate::error::{IpcError, Result};

/// Environment variable holding the endpoint a manager process connects to
pub const ENDPOINT_ENV: &str = "SCOPELINK_MANAGER_ENDPOINT";
/// Environment variable holding the role key a manager process hosts
pub const ROLE_ENV: &str = "SCOPELINK_MANAGER_ROLE";

const TAG_CONTROL: u8 = 0;
const TAG_ENVELOPE: u8 = 1;

/// Socket wait per idle pump iteration
const PUMP_POLL: Duration = Duration::from_millis(2);
/// Frames moved in one direction per pump iteration
const PUMP_BATCH: usize = 64;
/// How long a stopping pump keeps retrying frames the socket refused
const FLUSH_GRACE: Duration = Duration::from_millis(500);
/// zmq high-water mark in messages, both directions
const LINK_HWM: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Control(Vec<u8>),
    Envelope(Vec<u8>),
}

impl LinkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let (tag, body) = match self {
            LinkFrame::Control(body) => (TAG_CONTROL, body),
            LinkFrame::Envelope(body) => (TAG_ENVELOPE, body),
        };
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(tag);
        bytes.extend_from_slice(body);
        bytes
    }

    pub fn decode(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(IpcError::Codec("empty link frame".to_string()));
        }
        let body = bytes.split_off(1);
        match bytes[0] {
            TAG_CONTROL => Ok(LinkFrame::Control(body)),
            TAG_ENVELOPE => Ok(LinkFrame::Envelope(body)),
            other => Err(IpcError::Codec(format!("unknown link frame tag {}", other))),
        }
    }
}

/// One end of an orchestrator/manager PAIR socket
pub struct ProcessLink {
    socket: zmq::Socket,
    endpoint: String,
}

impl ProcessLink {
    /// Listen for one manager process; `tcp://127.0.0.1:*` picks a free port
    pub fn bind(context: &zmq::Context, address: &str) -> Result<Self> {
        let socket = context.socket(zmq::PAIR)?;
        socket.set_linger(0)?;
        socket.set_sndhwm(LINK_HWM)?;
        socket.set_rcvhwm(LINK_HWM)?;
        socket
            .bind(address)
            .map_err(|e| IpcError::Transport(format!("bind {}: {}", address, e)))?;
        let endpoint = match socket.get_last_endpoint()? {
            Ok(endpoint) => endpoint,
            Err(_) => address.to_string(),
        };
        info!("[LINK] Listening on {}", endpoint);
        Ok(Self { socket, endpoint })
    }

    /// Connect to the orchestrator
    ///
    /// `linger` bounds how long frames still queued in zmq survive the close.
    pub fn connect(context: &zmq::Context, endpoint: &str, linger: Duration) -> Result<Self> {
        let socket = context.socket(zmq::PAIR)?;
        socket.set_linger(linger.as_millis() as i32)?;
        socket.set_sndhwm(LINK_HWM)?;
        socket.set_rcvhwm(LINK_HWM)?;
        socket
            .connect(endpoint)
            .map_err(|e| IpcError::Transport(format!("connect {}: {}", endpoint, e)))?;
        info!("[LINK] Connected to {}", endpoint);
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one frame, blocking while the socket is at its high-water mark
    pub fn send(&self, frame: &LinkFrame) -> Result<()> {
        self.socket.send(frame.encode(), 0)?;
        Ok(())
    }

    /// Wait at most `timeout` for one frame
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<LinkFrame>> {
        let mut items = [self.socket.as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, timeout.as_millis() as i64)?;
        if !items[0].is_readable() {
            return Ok(None);
        }
        self.try_recv()
    }

    fn try_recv(&self) -> Result<Option<LinkFrame>> {
        match self.socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => LinkFrame::decode(bytes).map(Some),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// False when the socket cannot take the frame right now
    fn try_send(&self, bytes: &[u8]) -> Result<bool> {
        match self.socket.send(bytes, zmq::DONTWAIT) {
            Ok(()) => Ok(true),
            Err(zmq::Error::EAGAIN) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Host-defined handling of control frames
pub trait LinkControl: Send + 'static {
    /// A control body arrived from the peer
    fn on_control(&mut self, body: Vec<u8>);

    /// Next control body to send; polled every pump iteration
    fn poll_control(&mut self) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames written to the socket
    pub sent: u64,
    /// Envelope frames handed to the local side
    pub received: u64,
    /// Frames that failed to decode, or had nowhere to go
    pub dropped: u64,
}

/// Thread moving frames between a [`ProcessLink`] and a [`FramePipe`]
pub struct LinkPump {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<PumpStats>>,
}

impl LinkPump {
    pub fn spawn<C: LinkControl>(
        name: impl Into<String>,
        link: ProcessLink,
        pipe: FramePipe,
        control: C,
    ) -> Result<Self> {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || pump(link, pipe, control, flag))
            .map_err(|e| IpcError::Transport(format!("failed to spawn {}: {}", name, e)))?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush what is queued, stop, and return the counters
    pub fn stop(mut self) -> PumpStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> PumpStats {
        self.stop.store(true, Ordering::Release);
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("[LINK] {} pump panicked", self.name);
                PumpStats::default()
            }
            None => PumpStats::default(),
        }
    }
}

impl Drop for LinkPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct PumpState {
    /// Encoded link frames waiting for the socket
    outgoing: VecDeque<Vec<u8>>,
    /// Envelope frames waiting for the local channel
    incoming: VecDeque<Vec<u8>>,
    local_closed: bool,
    stats: PumpStats,
}

impl PumpState {
    fn collect<C: LinkControl>(&mut self, pipe: &FramePipe, control: &mut C) {
        while let Some(body) = control.poll_control() {
            self.outgoing.push_back(LinkFrame::Control(body).encode());
        }
        while !self.local_closed && self.outgoing.len() < PUMP_BATCH {
            match pipe.to_remote.try_recv() {
                Ok(frame) => self.outgoing.push_back(LinkFrame::Envelope(frame).encode()),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("[LINK] Local side closed");
                    self.local_closed = true;
                }
            }
        }
    }

    fn send(&mut self, link: &ProcessLink) {
        while let Some(bytes) = self.outgoing.front() {
            match link.try_send(bytes) {
                Ok(true) => {
                    self.outgoing.pop_front();
                    self.stats.sent += 1;
                }
                Ok(false) => break,
                Err(e) => {
                    warn!("[LINK] Dropping frame for {}: {}", link.endpoint(), e);
                    self.outgoing.pop_front();
                    self.stats.dropped += 1;
                }
            }
        }
    }

    fn deliver(&mut self, pipe: &FramePipe) {
        while let Some(frame) = self.incoming.pop_front() {
            match pipe.from_remote.try_send(frame) {
                Ok(()) => self.stats.received += 1,
                Err(TrySendError::Full(frame)) => {
                    self.incoming.push_front(frame);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    let lost = self.incoming.len() + 1;
                    debug!("[LINK] Local receiver gone, dropping {} frame(s)", lost);
                    self.stats.dropped += lost as u64;
                    self.incoming.clear();
                    break;
                }
            }
        }
    }

    fn receive<C: LinkControl>(&mut self, link: &ProcessLink, control: &mut C, wait: Duration) {
        let mut next = link.recv_timeout(wait);
        for _ in 0..PUMP_BATCH {
            match next {
                Ok(Some(LinkFrame::Envelope(frame))) => self.incoming.push_back(frame),
                Ok(Some(LinkFrame::Control(body))) => control.on_control(body),
                Ok(None) => return,
                Err(e) => {
                    warn!("[LINK] Bad frame on {}: {}", link.endpoint(), e);
                    self.stats.dropped += 1;
                }
            }
            if self.incoming.len() >= PUMP_BATCH {
                return;
            }
            next = link.try_recv();
        }
    }
}

fn pump<C: LinkControl>(link: ProcessLink, pipe: FramePipe, mut control: C, stop: Arc<AtomicBool>) -> PumpStats {
    let mut state = PumpState::default();
    debug!("[LINK] Pump on {} started", link.endpoint());

    while !stop.load(Ordering::Acquire) {
        state.collect(&pipe, &mut control);
        state.send(&link);
        state.deliver(&pipe);
        if state.incoming.len() >= PUMP_BATCH {
            thread::sleep(PUMP_POLL);
            continue;
        }
        let wait = if state.outgoing.is_empty() {
            PUMP_POLL
        } else {
            Duration::from_millis(1)
        };
        state.receive(&link, &mut control, wait);
    }

    let deadline = Instant::now() + FLUSH_GRACE;
    loop {
        state.collect(&pipe, &mut control);
        state.send(&link);
        state.receive(&link, &mut control, Duration::ZERO);
        state.deliver(&pipe);
        if state.outgoing.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if !state.outgoing.is_empty() {
        warn!(
            "[LINK] {} frame(s) never left {}",
            state.outgoing.len(),
            link.endpoint()
        );
        state.stats.dropped += state.outgoing.len() as u64;
    }
    debug!("[LINK] Pump on {} stopped: {:?}", link.endpoint(), state.stats);
    state.stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::duplex;
    use crate::command::{Command, CommandKind};
    use crate::registry::CommandRegistry;
    use crate::role::Role;
    use crate::wire::{Delivery, Envelope, Source};
    use crossbeam::channel::{unbounded, Sender};

    const LOOPBACK: &str = "tcp://127.0.0.1:*";

    struct Recorder(Sender<Vec<u8>>);

    impl LinkControl for Recorder {
        fn on_control(&mut self, body: Vec<u8>) {
            let _ = self.0.send(body);
        }
    }

    struct Announce(Option<Vec<u8>>);

    impl LinkControl for Announce {
        fn on_control(&mut self, _body: Vec<u8>) {}

        fn poll_control(&mut self) -> Option<Vec<u8>> {
            self.0.take()
        }
    }

    #[test]
    fn test_link_frame_tags() {
        let frame = LinkFrame::Envelope(vec![7, 8]);
        assert_eq!(frame.encode(), vec![TAG_ENVELOPE, 7, 8]);
        assert_eq!(LinkFrame::decode(frame.encode()).unwrap(), frame);
        assert_eq!(LinkFrame::decode(vec![TAG_CONTROL]).unwrap(), LinkFrame::Control(vec![]));
        assert!(matches!(LinkFrame::decode(vec![]), Err(IpcError::Codec(_))));
        assert!(matches!(LinkFrame::decode(vec![9, 1]), Err(IpcError::Codec(_))));
    }

    #[test]
    fn test_bind_resolves_wildcard_port() {
        let context = zmq::Context::new();
        let parent = ProcessLink::bind(&context, LOOPBACK).unwrap();
        assert!(parent.endpoint().starts_with("tcp://127.0.0.1:"));
        assert!(!parent.endpoint().ends_with('*'));

        let child = ProcessLink::connect(&context, parent.endpoint(), Duration::from_millis(100)).unwrap();
        child.send(&LinkFrame::Control(b"hello".to_vec())).unwrap();
        assert_eq!(
            parent.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(LinkFrame::Control(b"hello".to_vec()))
        );
        assert_eq!(parent.recv_timeout(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_pumps_carry_envelopes_both_ways() {
        let mut registry = CommandRegistry::new();
        registry
            .register(Role::LockController, CommandKind::FocusMoveCompleted, "focus_move_completed")
            .unwrap();
        let registry = Arc::new(registry);
        let focus = Role::Hardware("focus".into());

        let context = zmq::Context::new();
        let parent_link = ProcessLink::bind(&context, LOOPBACK).unwrap();
        let child_link =
            ProcessLink::connect(&context, parent_link.endpoint(), Duration::from_millis(200)).unwrap();

        // Orchestrator side: the router keeps its end, the pump stands in for the manager
        let (stand_in, router_end) = duplex(focus.clone(), 8, Arc::clone(&registry));
        let (controls_tx, controls_rx) = unbounded();
        let parent = LinkPump::spawn("test-parent", parent_link, stand_in.into_pipe(), Recorder(controls_tx)).unwrap();

        // Manager side: the runner keeps its end, the pump stands in for the router
        let (manager_end, local_router) = duplex(focus, 8, registry);
        let child = LinkPump::spawn(
            "test-child",
            child_link,
            local_router.into_pipe(),
            Announce(Some(b"up".to_vec())),
        )
        .unwrap();

        assert_eq!(controls_rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"up".to_vec());

        manager_end.send(Command::FocusMoveCompleted).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let envelope = loop {
            if let Some(envelope) = router_end.try_recv().unwrap() {
                break envelope;
            }
            assert!(Instant::now() < deadline, "envelope never crossed the link");
            thread::sleep(Duration::from_millis(2));
        };
        assert_eq!(envelope.payload, Command::FocusMoveCompleted);
        assert_eq!(envelope.destination, Delivery::Direct(Role::LockController));

        router_end
            .deliver(&Envelope::new(Source::Orchestrator, Delivery::Broadcast, Command::Quit))
            .unwrap();
        let quit = manager_end.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(quit.payload, Command::Quit);

        let child_stats = child.stop();
        let parent_stats = parent.stop();
        // Control announcement plus one envelope each way
        assert_eq!(child_stats.sent, 2);
        assert_eq!(child_stats.received, 1);
        assert_eq!(parent_stats.sent, 1);
        assert_eq!(parent_stats.received, 1);
    }
}
