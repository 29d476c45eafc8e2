// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Duplex manager channels
//!
//! Each manager owns one [`ManagerEnd`]; the router holds the matching
//! [`RouterEnd`]. Both directions are bounded crossbeam channels carrying
//! encoded envelope frames. Either end can be turned into a [`FramePipe`]
//! when its peer lives in another process.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::error::{IpcError, Result};
use crate::registry::CommandRegistry;
use crate::role::Role;
use crate::wire::{Envelope, Source};

/// Statistics for monitoring channel health
#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub capacity: usize,
    pub len: usize,
    pub is_full: bool,
    pub is_empty: bool,
}

impl ChannelStats {
    pub fn from_sender<T>(sender: &Sender<T>) -> Self {
        Self {
            capacity: sender.capacity().unwrap_or(0),
            len: sender.len(),
            is_full: sender.is_full(),
            is_empty: sender.is_empty(),
        }
    }

    /// Utilization in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }
}

/// Create the two ends of one manager's channel pair
pub fn duplex(role: Role, capacity: usize, registry: Arc<CommandRegistry>) -> (ManagerEnd, RouterEnd) {
    let (up_tx, up_rx) = bounded(capacity);
    let (down_tx, down_rx) = bounded(capacity);
    (
        ManagerEnd {
            role: role.clone(),
            tx: up_tx,
            rx: down_rx,
            registry,
        },
        RouterEnd {
            role,
            tx: down_tx,
            rx: up_rx,
        },
    )
}

/// Raw frame queues behind one channel end
///
/// `to_remote` yields frames this end would hand to its peer; frames that
/// arrive from the peer go into `from_remote`.
#[derive(Debug)]
pub struct FramePipe {
    pub(crate) to_remote: Receiver<Vec<u8>>,
    pub(crate) from_remote: Sender<Vec<u8>>,
}

/// Manager side of a duplex channel
#[derive(Debug, Clone)]
pub struct ManagerEnd {
    role: Role,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    registry: Arc<CommandRegistry>,
}

impl ManagerEnd {
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Send a command toward the router
    ///
    /// Fails with [`IpcError::UnregisteredCommand`] before anything is queued
    /// when no route exists for the command.
    pub fn send(&self, command: Command) -> Result<()> {
        let destination = self.registry.resolve(command.kind())?.clone();
        let frame = Envelope::new(Source::Manager(self.role.clone()), destination, command).encode()?;
        self.tx
            .send(frame)
            .map_err(|_| IpcError::ChannelClosed(self.role.to_string()))
    }

    /// Next delivered envelope, if one is waiting
    pub fn try_recv(&self) -> Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(frame) => Envelope::decode(&frame).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(IpcError::ChannelClosed(self.role.to_string())),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Envelope::decode(&frame).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::ChannelClosed(self.role.to_string())),
        }
    }

    /// Outbound (manager to router) queue statistics
    pub fn stats(&self) -> ChannelStats {
        ChannelStats::from_sender(&self.tx)
    }

    /// Stand in for a manager hosted elsewhere: frames the router delivers
    /// become outbound, frames from the manager feed the router
    pub fn into_pipe(self) -> FramePipe {
        FramePipe {
            to_remote: self.rx,
            from_remote: self.tx,
        }
    }
}

/// Router side of a duplex channel
#[derive(Debug)]
pub struct RouterEnd {
    role: Role,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl RouterEnd {
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub(crate) fn receiver(&self) -> &Receiver<Vec<u8>> {
        &self.rx
    }

    pub(crate) fn sender(&self) -> &Sender<Vec<u8>> {
        &self.tx
    }

    /// Next envelope sent by the manager, if one is waiting
    pub fn try_recv(&self) -> Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(frame) => Envelope::decode(&frame).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(IpcError::ChannelClosed(self.role.to_string())),
        }
    }

    /// Hand an envelope to the manager without going through a router
    pub fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        self.tx
            .send(frame)
            .map_err(|_| IpcError::ChannelClosed(self.role.to_string()))
    }

    /// Inbound (router to manager) queue statistics
    pub fn stats(&self) -> ChannelStats {
        ChannelStats::from_sender(&self.tx)
    }

    /// Stand in for a router hosted elsewhere
    pub fn into_pipe(self) -> FramePipe {
        FramePipe {
            to_remote: self.rx,
            from_remote: self.tx,
        }
    }
}
