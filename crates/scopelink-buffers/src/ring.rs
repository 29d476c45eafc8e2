// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity circular store of fixed-size records
//!
//! ## Contract
//! - `0 <= count <= capacity` at all times
//! - Reads return records in write order
//! - Every mutation (indices, count, purge counter, slot bytes) happens under
//!   the segment's one lock, so the group is atomic to every attacher
//! - A full buffer either refuses the write ([`OverflowPolicy::Strict`], state
//!   untouched) or drops the oldest records ([`OverflowPolicy::PurgeOldest`]),
//!   which is counted in the header, logged and reported in the outcome
//! - [`RingBuffer::peek_latest`] skips the lock and may observe a torn record;
//!   it exists for previews only

use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::error::{BufferError, Result};
use crate::handle::{BufferHandle, SegmentKind};
use crate::lock::SegmentLock;
use crate::segment::{offsets, SharedSegment, HEADER_SIZE};

/// What a write does when the buffer cannot take every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail with [`BufferError::Overflow`] and change nothing
    Strict,
    /// Drop as many oldest records as needed and keep going
    #[default]
    PurgeOldest,
}

/// Result of a successful write
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Purged { dropped: usize },
}

impl WriteOutcome {
    /// Records dropped to make room (0 for a plain write)
    pub fn dropped(&self) -> usize {
        match self {
            WriteOutcome::Written => 0,
            WriteOutcome::Purged { dropped } => *dropped,
        }
    }
}

/// One record copied out of a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: Vec<u8>,
    pub timestamp: f64,
}

/// Shared-memory ring buffer
///
/// Created once by its owner with [`RingBuffer::create`]; every other process
/// maps it with [`RingBuffer::attach`].
#[derive(Debug)]
pub struct RingBuffer {
    handle: BufferHandle,
    segment: SharedSegment,
    capacity: usize,
    record_size: usize,
}

impl RingBuffer {
    /// Allocate a new buffer at the handle's path
    pub fn create(handle: &BufferHandle, capacity: usize, record_size: usize) -> Result<Self> {
        if capacity == 0 || record_size == 0 {
            return Err(BufferError::InvalidGeometry(format!(
                "ring '{}' needs non-zero capacity and record size (got {} x {})",
                handle.name(),
                capacity,
                record_size
            )));
        }
        if !matches!(
            handle.kind(),
            SegmentKind::Ring | SegmentKind::Video | SegmentKind::Matrix
        ) {
            return Err(BufferError::InvalidGeometry(format!(
                "{:?} is not a ring buffer kind",
                handle.kind()
            )));
        }
        let segment = SharedSegment::create(handle.path(), handle.kind(), capacity, record_size)?;
        Ok(Self {
            handle: handle.clone(),
            segment,
            capacity,
            record_size,
        })
    }

    /// Map an existing buffer; never allocates or resets anything
    pub fn attach(handle: &BufferHandle) -> Result<Self> {
        let segment = SharedSegment::open(handle.path(), handle.kind())?;
        let capacity = segment.capacity();
        let record_size = segment.record_size();
        if capacity == 0 || record_size == 0 {
            return Err(BufferError::InvalidHeader {
                path: handle.path().to_path_buf(),
                reason: "ring with zero capacity or record size".to_string(),
            });
        }
        Ok(Self {
            handle: handle.clone(),
            segment,
            capacity,
            record_size,
        })
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub(crate) fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Unread records
    pub fn len(&self) -> usize {
        self.segment.atomic_u64(offsets::COUNT).load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Occupancy as a fraction of capacity, for backpressure decisions
    pub fn get_level(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Records dropped by purging since creation
    pub fn purge_count(&self) -> u64 {
        self.segment
            .atomic_u64(offsets::PURGE_COUNT)
            .load(Ordering::Acquire)
    }

    /// Remove the backing file (owner only, at shutdown)
    pub fn unlink(&self) -> Result<()> {
        self.segment.unlink()
    }

    fn lock(&self) -> SegmentLock<'_> {
        SegmentLock::acquire(self.segment.atomic_u32(offsets::LOCK))
    }

    fn slot_offset(&self, slot: usize) -> usize {
        HEADER_SIZE + self.capacity * 8 + slot * self.record_size
    }

    fn timestamp_offset(slot: usize) -> usize {
        HEADER_SIZE + slot * 8
    }

    fn cursors(&self) -> Cursors {
        Cursors {
            write: self.segment.atomic_u64(offsets::WRITE_INDEX).load(Ordering::Relaxed) as usize,
            read: self.segment.atomic_u64(offsets::READ_INDEX).load(Ordering::Relaxed) as usize,
            count: self.segment.atomic_u64(offsets::COUNT).load(Ordering::Relaxed) as usize,
        }
    }

    fn store_cursors(&self, cursors: Cursors) {
        self.segment
            .atomic_u64(offsets::WRITE_INDEX)
            .store(cursors.write as u64, Ordering::Release);
        self.segment
            .atomic_u64(offsets::READ_INDEX)
            .store(cursors.read as u64, Ordering::Release);
        self.segment
            .atomic_u64(offsets::COUNT)
            .store(cursors.count as u64, Ordering::Release);
    }

    /// Append one record
    pub fn write(&self, record: &[u8], timestamp: f64, policy: OverflowPolicy) -> Result<WriteOutcome> {
        if record.len() != self.record_size {
            return Err(BufferError::ShapeMismatch {
                expected: format!("{} bytes", self.record_size),
                actual: format!("{} bytes", record.len()),
            });
        }
        self.write_records(record, timestamp, policy)
    }

    /// Append `records.len() / record_size` records as one atomic group
    ///
    /// Every record gets the same timestamp. Under the strict policy the
    /// whole group is refused when it does not fit.
    pub fn write_records(
        &self,
        records: &[u8],
        timestamp: f64,
        policy: OverflowPolicy,
    ) -> Result<WriteOutcome> {
        let n = records.len() / self.record_size;
        if records.len() % self.record_size != 0 || n == 0 || n > self.capacity {
            return Err(BufferError::ShapeMismatch {
                expected: format!(
                    "1..={} records of {} bytes",
                    self.capacity, self.record_size
                ),
                actual: format!("{} bytes", records.len()),
            });
        }

        let guard = self.lock();
        let mut cursors = self.cursors();
        let free = self.capacity - cursors.count;
        let mut dropped = 0;
        if n > free {
            match policy {
                OverflowPolicy::Strict => {
                    return Err(BufferError::Overflow {
                        name: self.name().to_string(),
                        capacity: self.capacity,
                        count: cursors.count,
                        requested: n,
                    });
                }
                OverflowPolicy::PurgeOldest => {
                    dropped = n - free;
                    cursors.read = (cursors.read + dropped) % self.capacity;
                    cursors.count -= dropped;
                    self.segment
                        .atomic_u64(offsets::PURGE_COUNT)
                        .fetch_add(dropped as u64, Ordering::AcqRel);
                }
            }
        }

        for (i, record) in records.chunks_exact(self.record_size).enumerate() {
            let slot = (cursors.write + i) % self.capacity;
            self.segment.copy_in(self.slot_offset(slot), record);
            self.segment.write_f64(Self::timestamp_offset(slot), timestamp);
        }
        cursors.write = (cursors.write + n) % self.capacity;
        cursors.count += n;
        self.store_cursors(cursors);
        drop(guard);

        if dropped > 0 {
            warn!(
                "[RING] '{}' full: purged {} oldest record(s) ({} purged in total)",
                self.name(),
                dropped,
                self.purge_count()
            );
            Ok(WriteOutcome::Purged { dropped })
        } else {
            Ok(WriteOutcome::Written)
        }
    }

    /// Consume the oldest record
    pub fn read(&self) -> Result<Record> {
        self.read_with(|data, timestamp| Record {
            data: data.to_vec(),
            timestamp,
        })
    }

    /// Consume the oldest record, handing its bytes to `f` in place
    ///
    /// The lock is held while `f` runs; keep it short.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8], f64) -> R) -> Result<R> {
        let _guard = self.lock();
        let mut cursors = self.cursors();
        if cursors.count == 0 {
            return Err(BufferError::Underflow {
                name: self.name().to_string(),
            });
        }

        let slot = cursors.read;
        // SAFETY: the segment lock is held until after `f` returns
        let data = unsafe { self.segment.bytes(self.slot_offset(slot), self.record_size) };
        let out = f(data, self.segment.read_f64(Self::timestamp_offset(slot)));

        cursors.read = (cursors.read + 1) % self.capacity;
        cursors.count -= 1;
        self.store_cursors(cursors);
        Ok(out)
    }

    /// Copy the oldest record without consuming it
    pub fn peek_oldest(&self) -> Result<Record> {
        let _guard = self.lock();
        let cursors = self.cursors();
        if cursors.count == 0 {
            return Err(BufferError::Underflow {
                name: self.name().to_string(),
            });
        }
        Ok(self.copy_slot(cursors.read))
    }

    /// Copy the newest record without the lock
    ///
    /// Tear-tolerant preview: a concurrent writer may be filling the slot.
    pub fn peek_latest(&self) -> Option<Record> {
        let count = self.len();
        if count == 0 {
            return None;
        }
        let write = self
            .segment
            .atomic_u64(offsets::WRITE_INDEX)
            .load(Ordering::Acquire) as usize;
        let slot = (write + self.capacity - 1) % self.capacity;
        Some(self.copy_slot(slot))
    }

    fn copy_slot(&self, slot: usize) -> Record {
        let mut data = vec![0u8; self.record_size];
        self.segment.copy_out(self.slot_offset(slot), &mut data);
        Record {
            data,
            timestamp: self.segment.read_f64(Self::timestamp_offset(slot)),
        }
    }

    /// Drop up to `n` oldest records without copying them; returns how many
    pub fn discard(&self, n: usize) -> usize {
        let _guard = self.lock();
        let mut cursors = self.cursors();
        let k = n.min(cursors.count);
        cursors.read = (cursors.read + k) % self.capacity;
        cursors.count -= k;
        self.store_cursors(cursors);
        if k > 0 {
            debug!("[RING] '{}' discarded {} record(s)", self.name(), k);
        }
        k
    }

    /// Consume every unread record, oldest first
    pub fn drain(&self) -> Vec<Record> {
        let _guard = self.lock();
        let mut cursors = self.cursors();
        let records = (0..cursors.count)
            .map(|i| self.copy_slot((cursors.read + i) % self.capacity))
            .collect();
        cursors.read = cursors.write;
        cursors.count = 0;
        self.store_cursors(cursors);
        records
    }

    /// Copy the newest `n` unread records (fewer if not available), oldest first
    pub fn latest(&self, n: usize) -> Vec<Record> {
        let _guard = self.lock();
        let cursors = self.cursors();
        let k = n.min(cursors.count);
        let first = (cursors.write + self.capacity - k) % self.capacity;
        (0..k)
            .map(|i| self.copy_slot((first + i) % self.capacity))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursors {
    write: usize,
    read: usize,
    count: usize,
}
