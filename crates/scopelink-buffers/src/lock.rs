// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-segment locks
//!
//! Every segment header carries one lock word. [`SegmentLock`] is the short
//! critical-section guard used by ring buffers and the pool flag.
//! [`ExclusiveLock`] is a standalone segment whose word serializes access to
//! a single-client hardware context (one GPU, one device handle) across
//! workers, possibly for a whole hardware operation.

use crossbeam::utils::Backoff;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::handle::{BufferHandle, SegmentKind};
use crate::segment::{offsets, SharedSegment};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Sleep once spinning stops paying off; exclusive holds can be long
const PARK_INTERVAL: Duration = Duration::from_micros(50);

/// RAII guard over a header lock word
pub(crate) struct SegmentLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SegmentLock<'a> {
    pub(crate) fn acquire(word: &'a AtomicU32) -> Self {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = Self::try_acquire(word) {
                return guard;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    pub(crate) fn try_acquire(word: &'a AtomicU32) -> Option<Self> {
        word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self { word })
    }
}

impl Drop for SegmentLock<'_> {
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

/// Offset of the acquisition counter inside the geometry block
const ACQUISITIONS: usize = offsets::GEOMETRY;

/// Cross-process mutual exclusion for one hardware context
#[derive(Debug)]
pub struct ExclusiveLock {
    segment: SharedSegment,
    handle: BufferHandle,
}

/// Held exclusive lock; released on drop
pub struct ExclusiveGuard<'a> {
    _lock: SegmentLock<'a>,
}

impl ExclusiveLock {
    pub fn create(handle: &BufferHandle) -> Result<Self> {
        let segment = SharedSegment::create(handle.path(), SegmentKind::ExclusiveLock, 0, 0)?;
        Ok(Self {
            segment,
            handle: handle.clone(),
        })
    }

    /// Create a lock segment named `name` under `dir`
    pub fn create_in(dir: &Path, name: &str) -> Result<Self> {
        Self::create(&BufferHandle::new(dir, name, SegmentKind::ExclusiveLock))
    }

    pub fn attach(handle: &BufferHandle) -> Result<Self> {
        let segment = SharedSegment::open(handle.path(), SegmentKind::ExclusiveLock)?;
        Ok(Self {
            segment,
            handle: handle.clone(),
        })
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    fn word(&self) -> &AtomicU32 {
        self.segment.atomic_u32(offsets::LOCK)
    }

    /// Block until the lock is held
    pub fn lock(&self) -> ExclusiveGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            if backoff.is_completed() {
                std::thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn try_lock(&self) -> Option<ExclusiveGuard<'_>> {
        let lock = SegmentLock::try_acquire(self.word())?;
        self.segment
            .atomic_u64(ACQUISITIONS)
            .fetch_add(1, Ordering::Relaxed);
        debug!("[EXCLUSIVE] Acquired {}", self.segment.path().display());
        Some(ExclusiveGuard { _lock: lock })
    }

    pub fn is_locked(&self) -> bool {
        self.word().load(Ordering::Acquire) == LOCKED
    }

    /// Number of times the lock has been taken since creation
    pub fn acquisitions(&self) -> u64 {
        self.segment.atomic_u64(ACQUISITIONS).load(Ordering::Relaxed)
    }

    pub fn unlink(&self) -> Result<()> {
        self.segment.unlink()
    }
}
