// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Pool flag: shared worker-pool cycle state
//!
//! ```text
//!          begin_cycle              finish_cycle             recycle
//!   IDLE ──────────────▶ RUNNING ──────────────▶ FINISHED ──────────▶ IDLE
//!                         │  ▲
//!            task_started │  │ task_finished      (busy in [0, workers])
//!                         ▼  │
//! ```
//!
//! RUNNING is only entered from IDLE, so a producer never reuses buffers a
//! cycle still depends on. Every mutation takes the segment lock.
//!
//! Geometry block:
//! ```text
//! [128:132] state (atomic u32)
//! [132:136] busy workers (atomic u32)
//! [136:140] worker count (atomic u32)
//! [140:144] tasks not yet finished this cycle (atomic u32)
//! [144:152] cycle counter (atomic u64)
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::debug;

use crate::error::{PoolFlagError, Result};
use crate::handle::{BufferHandle, SegmentKind};
use crate::lock::SegmentLock;
use crate::segment::{offsets, SharedSegment};

const STATE: usize = offsets::GEOMETRY;
const BUSY: usize = offsets::GEOMETRY + 4;
const WORKERS: usize = offsets::GEOMETRY + 8;
const PENDING: usize = offsets::GEOMETRY + 12;
const CYCLE: usize = offsets::GEOMETRY + 16;

/// Pool cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PoolState {
    Idle = 0,
    Running = 1,
    Finished = 2,
}

impl PoolState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Running),
            2 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Shared pool state living in its own segment
#[derive(Debug)]
pub struct PoolFlag {
    segment: SharedSegment,
    handle: BufferHandle,
}

impl PoolFlag {
    pub fn create(handle: &BufferHandle, worker_count: u32) -> Result<Self> {
        if worker_count == 0 {
            return Err(crate::error::BufferError::InvalidGeometry(
                "pool flag needs at least one worker".to_string(),
            ));
        }
        let segment = SharedSegment::create(handle.path(), SegmentKind::PoolFlag, 0, 0)?;
        segment
            .atomic_u32(WORKERS)
            .store(worker_count, Ordering::Release);
        Ok(Self {
            segment,
            handle: handle.clone(),
        })
    }

    /// Create a pool flag named `name` under `dir`
    pub fn create_in(dir: &Path, name: &str, worker_count: u32) -> Result<Self> {
        Self::create(&BufferHandle::new(dir, name, SegmentKind::PoolFlag), worker_count)
    }

    pub fn attach(handle: &BufferHandle) -> Result<Self> {
        let segment = SharedSegment::open(handle.path(), SegmentKind::PoolFlag)?;
        Ok(Self {
            segment,
            handle: handle.clone(),
        })
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn unlink(&self) -> Result<()> {
        self.segment.unlink()
    }

    fn lock(&self) -> SegmentLock<'_> {
        SegmentLock::acquire(self.segment.atomic_u32(offsets::LOCK))
    }

    fn load(&self, offset: usize) -> u32 {
        self.segment.atomic_u32(offset).load(Ordering::Acquire)
    }

    fn store(&self, offset: usize, value: u32) {
        self.segment.atomic_u32(offset).store(value, Ordering::Release);
    }

    pub fn state(&self) -> std::result::Result<PoolState, PoolFlagError> {
        let raw = self.load(STATE);
        PoolState::from_u32(raw).ok_or(PoolFlagError::CorruptState(raw))
    }

    pub fn busy(&self) -> u32 {
        self.load(BUSY)
    }

    pub fn worker_count(&self) -> u32 {
        self.load(WORKERS)
    }

    /// Tasks of the current cycle that have not finished
    pub fn pending(&self) -> u32 {
        self.load(PENDING)
    }

    pub fn cycle(&self) -> u64 {
        self.segment.atomic_u64(CYCLE).load(Ordering::Acquire)
    }

    fn expect(&self, wanted: PoolState, action: &'static str) -> std::result::Result<(), PoolFlagError> {
        let from = self.state()?;
        if from != wanted {
            return Err(PoolFlagError::InvalidTransition { from, action });
        }
        Ok(())
    }

    /// IDLE → RUNNING for a cycle of `tasks` tasks; returns the cycle number
    pub fn begin_cycle(&self, tasks: u32) -> std::result::Result<u64, PoolFlagError> {
        let _guard = self.lock();
        self.expect(PoolState::Idle, "begin a cycle")?;
        if tasks == 0 {
            return Err(PoolFlagError::InvalidTransition {
                from: PoolState::Idle,
                action: "begin an empty cycle",
            });
        }
        self.store(PENDING, tasks);
        self.store(BUSY, 0);
        self.store(STATE, PoolState::Running as u32);
        let cycle = self.segment.atomic_u64(CYCLE).fetch_add(1, Ordering::AcqRel) + 1;
        debug!("[POOL-FLAG] Cycle {} started with {} task(s)", cycle, tasks);
        Ok(cycle)
    }

    /// A worker picked up a task; returns the new busy count
    pub fn task_started(&self) -> std::result::Result<u32, PoolFlagError> {
        let _guard = self.lock();
        self.expect(PoolState::Running, "start a task")?;
        let busy = self.load(BUSY) + 1;
        let worker_count = self.load(WORKERS);
        if busy > worker_count {
            return Err(PoolFlagError::BusyOutOfRange {
                attempted: busy as i64,
                worker_count,
            });
        }
        self.store(BUSY, busy);
        Ok(busy)
    }

    /// A worker finished a task; returns the tasks still outstanding
    pub fn task_finished(&self) -> std::result::Result<u32, PoolFlagError> {
        let _guard = self.lock();
        self.expect(PoolState::Running, "finish a task")?;
        let busy = self.load(BUSY);
        if busy == 0 {
            return Err(PoolFlagError::BusyOutOfRange {
                attempted: -1,
                worker_count: self.load(WORKERS),
            });
        }
        self.store(BUSY, busy - 1);
        let pending = self.load(PENDING).saturating_sub(1);
        self.store(PENDING, pending);
        Ok(pending)
    }

    /// RUNNING → FINISHED once nothing is busy or outstanding
    pub fn finish_cycle(&self) -> std::result::Result<(), PoolFlagError> {
        let _guard = self.lock();
        self.expect(PoolState::Running, "finish the cycle")?;
        if self.load(BUSY) != 0 || self.load(PENDING) != 0 {
            return Err(PoolFlagError::InvalidTransition {
                from: PoolState::Running,
                action: "finish the cycle while tasks are outstanding",
            });
        }
        self.store(STATE, PoolState::Finished as u32);
        debug!("[POOL-FLAG] Cycle {} finished", self.cycle());
        Ok(())
    }

    /// FINISHED → IDLE after the producer recycled its buffers
    pub fn recycle(&self) -> std::result::Result<(), PoolFlagError> {
        let _guard = self.lock();
        self.expect(PoolState::Finished, "recycle")?;
        self.store(STATE, PoolState::Idle as u32);
        Ok(())
    }
}
