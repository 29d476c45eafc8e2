// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink-ipc
//!
//! Control plane: typed commands, their wire encoding, the startup-built
//! command registry, per-manager duplex channels and the router that moves
//! envelopes between them.
//!
//! ## Delivery
//! - **Direct**: exactly one role registered a handler; sent to it alone
//! - **Broadcast**: every live manager (lifecycle and shared acquisition state)
//! - **Local**: executed by the router host (diagnostics)
//!
//! Sending a command nobody registered fails at the send call with
//! [`IpcError::UnregisteredCommand`].
//!
//! Managers in other OS processes reach the router through a
//! [`transport::ProcessLink`], a zmq PAIR socket pumped into the same
//! channels.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod channel;
pub mod command;
pub mod error;
pub mod registry;
pub mod role;
pub mod router;
pub mod transport;
pub mod wire;

pub use channel::{duplex, ChannelStats, FramePipe, ManagerEnd, RouterEnd};
pub use command::{
    AcquisitionMode, BeadMove, BeadRoi, Command, CommandKind, DeliveryMode, ScriptStatus, ScriptStep,
};
pub use error::{IpcError, Result};
pub use registry::{CommandRegistry, Route, LOCAL_HANDLER, RUNNER_HANDLER};
pub use role::Role;
pub use router::{LocalHandler, Outbox, Router, RouterStats, DEFAULT_BACKLOG_LIMIT};
pub use transport::{LinkControl, LinkFrame, LinkPump, ProcessLink, PumpStats, ENDPOINT_ENV, ROLE_ENV};
pub use wire::{Delivery, Envelope, Source, WIRE_VERSION};
