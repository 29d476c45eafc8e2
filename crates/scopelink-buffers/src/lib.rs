// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # scopelink-buffers
//!
//! Shared-memory data plane. Every structure lives in its own file-backed
//! segment with a fixed 256-byte header, so any process that knows the path
//! can attach without side-channel configuration.
//!
//! ```text
//!  owner process                         attaching process
//!  ─────────────                         ─────────────────
//!  VideoBuffer::create(handle) ──┐   ┌── VideoBuffer::attach(handle)
//!                                ▼   ▼
//!                   /dev/shm/scopelink-video.shm
//!                   [header | timestamps | slots]
//! ```
//!
//! ## Components
//! - [`RingBuffer`]: fixed-size records, strict or purge-oldest overflow
//! - [`VideoBuffer`]: image stacks with geometry and dtype in the header
//! - [`MatrixBuffer`]: fixed-width `f64` rows, multi-row atomic writes
//! - [`PoolFlag`]: IDLE / RUNNING / FINISHED worker-pool cycle state
//! - [`ExclusiveLock`]: one holder at a time for a hardware context
//!
//! Each segment has exactly one creator; the creator unlinks it at shutdown.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod handle;
pub mod lock;
pub mod matrix;
pub mod pool_flag;
pub mod ring;
pub mod segment;
pub mod video;

pub use error::{BufferError, PoolFlagError, Result};
pub use handle::{BufferHandle, SegmentKind};
pub use lock::{ExclusiveGuard, ExclusiveLock};
pub use matrix::MatrixBuffer;
pub use pool_flag::{PoolFlag, PoolState};
pub use ring::{OverflowPolicy, Record, RingBuffer, WriteOutcome};
pub use segment::SharedSegment;
pub use video::{Pixel, StackGeometry, VideoBuffer};
