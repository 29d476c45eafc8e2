// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Attach handles
//!
//! A [`BufferHandle`] is everything another process needs to map a segment:
//! the file path and the kind of structure expected inside. Handles are plain
//! data and travel freely; geometry is read back from the segment header.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a segment holds, stored in its header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SegmentKind {
    Ring = 1,
    Video = 2,
    Matrix = 3,
    PoolFlag = 4,
    ExclusiveLock = 5,
}

impl SegmentKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Ring),
            2 => Some(Self::Video),
            3 => Some(Self::Matrix),
            4 => Some(Self::PoolFlag),
            5 => Some(Self::ExclusiveLock),
            _ => None,
        }
    }
}

/// Location and kind of a shared segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle {
    name: String,
    path: PathBuf,
    kind: SegmentKind,
}

impl BufferHandle {
    /// Handle for segment `name` under `dir` (`<dir>/scopelink-<name>.shm`)
    pub fn new(dir: &Path, name: &str, kind: SegmentKind) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("scopelink-{}.shm", name)),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_path() {
        let handle = BufferHandle::new(Path::new("/dev/shm"), "video", SegmentKind::Video);
        assert_eq!(handle.path(), Path::new("/dev/shm/scopelink-video.shm"));
        assert_eq!(handle.kind(), SegmentKind::Video);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            SegmentKind::Ring,
            SegmentKind::Video,
            SegmentKind::Matrix,
            SegmentKind::PoolFlag,
            SegmentKind::ExclusiveLock,
        ] {
            assert_eq!(SegmentKind::from_u32(kind as u32), Some(kind));
        }
        assert_eq!(SegmentKind::from_u32(0), None);
    }
}
