// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the shared-memory data plane

use std::path::PathBuf;
use thiserror::Error;

use crate::handle::SegmentKind;
use crate::pool_flag::PoolState;

/// Ring buffer, segment and lock errors
#[derive(Debug, Error)]
pub enum BufferError {
    /// Write on a full buffer under the strict policy; nothing was changed
    #[error("Buffer '{name}' overflow: {count}/{capacity} records, {requested} more requested")]
    Overflow {
        name: String,
        capacity: usize,
        count: usize,
        requested: usize,
    },

    /// Read on an empty buffer; indices are unchanged
    #[error("Buffer '{name}' underflow: no unread records")]
    Underflow { name: String },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Invalid segment header in {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("Segment {path} holds a {found:?}, expected a {expected:?}")]
    KindMismatch {
        path: PathBuf,
        expected: SegmentKind,
        found: SegmentKind,
    },

    #[error("Invalid buffer geometry: {0}")]
    InvalidGeometry(String),

    #[error("Segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pool flag state machine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolFlagError {
    #[error("Pool flag cannot {action} from {from:?}")]
    InvalidTransition { from: PoolState, action: &'static str },

    #[error("Pool busy count {attempted} would leave [0, {worker_count}]")]
    BusyOutOfRange { attempted: i64, worker_count: u32 },

    #[error("Pool flag segment holds unknown state {0}")]
    CorruptState(u32),
}

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;
