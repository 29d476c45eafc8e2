// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory segment
//!
//! One file-backed mapping per buffer, flag or lock. The creating process
//! sizes the file and writes the header; every other process opens the same
//! path and validates the header before touching anything else.
//!
//! Format:
//! ```text
//! Header (256 bytes):
//!   [0:8]     Magic "SCOPELNK" (8 bytes ASCII)
//!   [8:12]    Version (u32 LE)
//!   [12:16]   Segment kind (u32 LE)
//!   [16:24]   Capacity in records (u64 LE)
//!   [24:32]   Record size in bytes (u64 LE)
//!   [32:40]   Write index (atomic u64)
//!   [40:48]   Read index (atomic u64)
//!   [48:56]   Count (atomic u64)
//!   [56:64]   Purge counter (atomic u64)
//!   [64:68]   Lock word (atomic u32)
//!   [68:128]  Reserved (zeros)
//!   [128:256] Kind-specific geometry (zeros when unused)
//!
//! Then capacity x 8 bytes of f64 timestamps (LE), then
//! capacity x record_size bytes of record slots.
//! ```
//!
//! Offsets are always interpreted locally after mapping; no pointer ever
//! crosses the process boundary.

use memmap2::MmapRaw;
use std::fs::OpenOptions;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use tracing::{debug, info};

use crate::error::{BufferError, Result};
use crate::handle::SegmentKind;

pub const MAGIC: &[u8; 8] = b"SCOPELNK";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 256;

/// Byte offsets inside the header
pub(crate) mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 8;
    pub const KIND: usize = 12;
    pub const CAPACITY: usize = 16;
    pub const RECORD_SIZE: usize = 24;
    pub const WRITE_INDEX: usize = 32;
    pub const READ_INDEX: usize = 40;
    pub const COUNT: usize = 48;
    pub const PURGE_COUNT: usize = 56;
    pub const LOCK: usize = 64;
    pub const GEOMETRY: usize = 128;
}

/// Mapped segment file
pub struct SharedSegment {
    path: PathBuf,
    map: MmapRaw,
    kind: SegmentKind,
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("len", &self.map.len())
            .finish()
    }
}

/// Total file size for a segment of the given shape
pub fn segment_len(capacity: usize, record_size: usize) -> Option<usize> {
    let timestamps = capacity.checked_mul(8)?;
    let slots = capacity.checked_mul(record_size)?;
    HEADER_SIZE.checked_add(timestamps)?.checked_add(slots)
}

impl SharedSegment {
    /// Create (or truncate and re-create) the segment file and write its header
    pub fn create(
        path: &Path,
        kind: SegmentKind,
        capacity: usize,
        record_size: usize,
    ) -> Result<Self> {
        let total_size = segment_len(capacity, record_size).ok_or_else(|| {
            BufferError::InvalidGeometry(format!(
                "{} records of {} bytes overflow the address space",
                capacity, record_size
            ))
        })?;

        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Fresh length means the whole mapping starts zeroed
        file.set_len(total_size as u64)?;
        let map = MmapRaw::map_raw(&file)?;

        let segment = Self {
            path: path.to_path_buf(),
            map,
            kind,
        };
        segment.copy_in(offsets::MAGIC, MAGIC);
        segment.write_u32(offsets::VERSION, VERSION);
        segment.write_u32(offsets::KIND, kind as u32);
        segment.write_u64(offsets::CAPACITY, capacity as u64);
        segment.write_u64(offsets::RECORD_SIZE, record_size as u64);
        segment.map.flush()?;

        info!(
            "[SHM] Created {:?} segment {} ({} x {} bytes, {} bytes total)",
            kind,
            path.display(),
            capacity,
            record_size,
            total_size
        );
        Ok(segment)
    }

    /// Map an existing segment, validating magic, version, kind and size
    pub fn open(path: &Path, expected: SegmentKind) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            return Err(BufferError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!("file is {} bytes, smaller than the header", file_len),
            });
        }

        let map = MmapRaw::map_raw(&file)?;
        let mut segment = Self {
            path: path.to_path_buf(),
            map,
            kind: expected,
        };

        let mut magic = [0u8; 8];
        segment.copy_out(offsets::MAGIC, &mut magic);
        if &magic != MAGIC {
            return Err(segment.invalid("bad magic"));
        }
        let version = segment.read_u32(offsets::VERSION);
        if version != VERSION {
            return Err(segment.invalid(&format!("version {} (expected {})", version, VERSION)));
        }
        let raw_kind = segment.read_u32(offsets::KIND);
        let found =
            SegmentKind::from_u32(raw_kind).ok_or_else(|| segment.invalid(&format!("unknown kind {}", raw_kind)))?;
        if found != expected {
            return Err(BufferError::KindMismatch {
                path: path.to_path_buf(),
                expected,
                found,
            });
        }
        segment.kind = found;

        let declared = segment_len(segment.capacity(), segment.record_size())
            .ok_or_else(|| segment.invalid("declared shape overflows"))?;
        if declared != segment.len() {
            return Err(segment.invalid(&format!(
                "declared size {} does not match mapping of {} bytes",
                declared,
                segment.len()
            )));
        }

        debug!("[SHM] Attached {:?} segment {}", found, path.display());
        Ok(segment)
    }

    fn invalid(&self, reason: &str) -> BufferError {
        BufferError::InvalidHeader {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.read_u64(offsets::CAPACITY) as usize
    }

    pub fn record_size(&self) -> usize {
        self.read_u64(offsets::RECORD_SIZE) as usize
    }

    /// Remove the backing file; existing mappings stay valid until dropped
    pub fn unlink(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("[SHM] Unlinked {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset + len <= self.map.len(),
            "segment access [{}..{}) past end {}",
            offset,
            offset + len,
            self.map.len()
        );
        // SAFETY: bounds checked above
        unsafe { self.map.as_mut_ptr().add(offset) }
    }

    pub(crate) fn copy_in(&self, offset: usize, src: &[u8]) {
        let dst = self.ptr(offset, src.len());
        // SAFETY: in bounds; the mapping never aliases a Rust-owned slice
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
    }

    pub(crate) fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let src = self.ptr(offset, dst.len());
        // SAFETY: in bounds; the mapping never aliases a Rust-owned slice
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock that serializes writers of this range
    /// for as long as the slice lives.
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr(offset, len), len)
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.copy_out(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub(crate) fn write_u32(&self, offset: usize, value: u32) {
        self.copy_in(offset, &value.to_le_bytes());
    }

    pub(crate) fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.copy_out(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub(crate) fn write_u64(&self, offset: usize, value: u64) {
        self.copy_in(offset, &value.to_le_bytes());
    }

    pub(crate) fn read_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.read_u64(offset))
    }

    pub(crate) fn write_f64(&self, offset: usize, value: f64) {
        self.write_u64(offset, value.to_bits());
    }

    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "misaligned atomic u32 at {}", offset);
        // SAFETY: the mapping is page aligned, the offset is 4-aligned and in bounds,
        // and the word is only ever accessed atomically
        unsafe { &*(self.ptr(offset, 4) as *const AtomicU32) }
    }

    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert_eq!(offset % 8, 0, "misaligned atomic u64 at {}", offset);
        // SAFETY: as for atomic_u32, with 8-byte alignment
        unsafe { &*(self.ptr(offset, 8) as *const AtomicU64) }
    }
}
