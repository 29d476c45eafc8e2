// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane error types

use thiserror::Error;

use crate::command::CommandKind;
use crate::role::Role;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IpcError {
    #[error("Command {0:?} is not registered")]
    UnregisteredCommand(CommandKind),

    #[error("Command {kind:?} already has a direct handler on {existing}, {attempted} cannot register one")]
    HandlerConflict {
        kind: CommandKind,
        existing: Role,
        attempted: Role,
    },

    #[error("Command {kind:?} is executed by the router, {attempted} cannot register a handler")]
    ReservedCommand { kind: CommandKind, attempted: Role },

    #[error("Command {0:?} cannot be used in a script")]
    NotScriptEligible(CommandKind),

    #[error("Channel to {0} is closed")]
    ChannelClosed(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Wire version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    #[error("Process link error: {0}")]
    Transport(String),
}

impl From<zmq::Error> for IpcError {
    fn from(err: zmq::Error) -> Self {
        IpcError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for IpcError {
    fn from(err: bincode::Error) -> Self {
        IpcError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
