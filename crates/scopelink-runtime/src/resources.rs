// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared resources
//!
//! [`SharedBuffers`] is the owner side: the orchestrator creates every
//! segment once before any manager starts and unlinks them at shutdown.
//! [`SharedResources`] is what each manager host receives in the
//! `configure_shared_resources` handshake: handles to attach, the run
//! configuration and its channel endpoint.

use scopelink_buffers::{
    BufferHandle, ExclusiveLock, MatrixBuffer, OverflowPolicy, PoolFlag, SegmentKind, StackGeometry,
    VideoBuffer,
};
use scopelink_config::{BuffersConfig, OverflowMode, ScopeConfig};
use scopelink_ipc::{ManagerEnd, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result as ManagerResult};

/// Tracks buffer columns: `t, x, y, z, bead_id, roi_x, roi_y`
pub const TRACK_COLUMNS: usize = 7;

/// Column indices into a tracks row
pub mod track_col {
    pub const T: usize = 0;
    pub const X: usize = 1;
    pub const Y: usize = 2;
    pub const Z: usize = 3;
    pub const BEAD_ID: usize = 4;
    pub const ROI_X: usize = 5;
    pub const ROI_Y: usize = 6;
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Segment-name prefix unique to this process and run
pub fn new_run_id() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Local::now().format("%Y%m%d%H%M%S"),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Map the configured overflow mode onto a buffer policy
pub fn overflow_policy(buffers: &BuffersConfig) -> OverflowPolicy {
    match buffers.overflow {
        OverflowMode::Purge => OverflowPolicy::PurgeOldest,
        OverflowMode::Strict => OverflowPolicy::Strict,
    }
}

/// Segment names every run uses; requests may not reuse them
const RESERVED_SEGMENTS: [&str; 4] = ["video", "tracks", "pool", "gpu"];

/// Extra matrix buffer a manager asks the orchestrator to allocate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequest {
    pub name: String,
    pub rows: usize,
    pub n_cols: usize,
}

/// Handles to every segment of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHandles {
    pub video: BufferHandle,
    pub tracks: BufferHandle,
    pub pool_flag: BufferHandle,
    pub gpu_lock: BufferHandle,
    /// Requested matrix buffers by request name
    pub extra: BTreeMap<String, BufferHandle>,
}

impl BufferHandles {
    pub fn for_run(dir: &Path, run_id: &str) -> Self {
        Self {
            video: BufferHandle::new(dir, &format!("{}-video", run_id), SegmentKind::Video),
            tracks: BufferHandle::new(dir, &format!("{}-tracks", run_id), SegmentKind::Matrix),
            pool_flag: BufferHandle::new(dir, &format!("{}-pool", run_id), SegmentKind::PoolFlag),
            gpu_lock: BufferHandle::new(dir, &format!("{}-gpu", run_id), SegmentKind::ExclusiveLock),
            extra: BTreeMap::new(),
        }
    }
}

/// Segment files created so far by one `allocate`; removed on drop unless kept
struct CreatedSegments {
    paths: Vec<PathBuf>,
}

impl CreatedSegments {
    fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, handle: &BufferHandle) {
        self.paths.push(handle.path().to_path_buf());
    }

    fn keep(mut self) {
        self.paths.clear();
    }
}

impl Drop for CreatedSegments {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("[SHM] Removed partial segment {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("[SHM] Failed to remove partial segment {}: {}", path.display(), e),
            }
        }
    }
}

fn check_requests(requests: &[BufferRequest]) -> ManagerResult<()> {
    let mut seen = Vec::with_capacity(requests.len());
    for request in requests {
        let name = request.name.as_str();
        if name.is_empty() || RESERVED_SEGMENTS.contains(&name) || seen.contains(&name) {
            return Err(ManagerError::InvalidRequest(format!(
                "buffer name '{}' is empty, reserved or requested twice",
                name
            )));
        }
        seen.push(name);
    }
    Ok(())
}

/// Owner of every segment in a run
#[derive(Debug)]
pub struct SharedBuffers {
    handles: BufferHandles,
    video: VideoBuffer,
    tracks: MatrixBuffer,
    pool_flag: PoolFlag,
    gpu_lock: ExclusiveLock,
    extra: Vec<MatrixBuffer>,
}

impl SharedBuffers {
    /// Create all segments described by `config` plus `requests`
    ///
    /// On failure every segment created so far is removed again.
    pub fn allocate(config: &ScopeConfig, run_id: &str, requests: &[BufferRequest]) -> ManagerResult<Self> {
        check_requests(requests)?;
        let dir = config.buffers.segment_dir.as_path();
        let mut handles = BufferHandles::for_run(dir, run_id);
        let mut created = CreatedSegments::new();

        let geometry = StackGeometry::new(
            config.buffers.video_stack_depth,
            config.camera.height,
            config.camera.width,
            config.camera.bits,
        )?;
        created.track(&handles.video);
        let video = VideoBuffer::create(&handles.video, config.buffers.video_stacks, geometry)?;
        created.track(&handles.tracks);
        let tracks = MatrixBuffer::create(&handles.tracks, config.buffers.tracks_rows, TRACK_COLUMNS)?;
        created.track(&handles.pool_flag);
        let pool_flag = PoolFlag::create(&handles.pool_flag, config.pool.workers as u32)?;
        created.track(&handles.gpu_lock);
        let gpu_lock = ExclusiveLock::create(&handles.gpu_lock)?;

        let mut extra = Vec::with_capacity(requests.len());
        for request in requests {
            let handle = BufferHandle::new(
                dir,
                &format!("{}-{}", run_id, request.name),
                SegmentKind::Matrix,
            );
            created.track(&handle);
            extra.push(MatrixBuffer::create(&handle, request.rows, request.n_cols)?);
            handles.extra.insert(request.name.clone(), handle);
        }
        created.keep();

        info!(
            "[SHM] Allocated run {} in {}: video {}x{:?}, tracks {}x{}, {} extra",
            run_id,
            dir.display(),
            config.buffers.video_stacks,
            geometry.shape(),
            config.buffers.tracks_rows,
            TRACK_COLUMNS,
            extra.len()
        );

        Ok(Self {
            handles,
            video,
            tracks,
            pool_flag,
            gpu_lock,
            extra,
        })
    }

    pub fn handles(&self) -> &BufferHandles {
        &self.handles
    }

    pub fn video(&self) -> &VideoBuffer {
        &self.video
    }

    pub fn tracks(&self) -> &MatrixBuffer {
        &self.tracks
    }

    pub fn pool_flag(&self) -> &PoolFlag {
        &self.pool_flag
    }

    /// Remove every segment file; attached mappings stay valid until dropped
    pub fn unlink_all(&self) {
        let mut results = vec![
            (self.handles.video.name(), self.video.unlink()),
            (self.handles.tracks.name(), self.tracks.unlink()),
            (self.handles.pool_flag.name(), self.pool_flag.unlink()),
            (self.handles.gpu_lock.name(), self.gpu_lock.unlink()),
        ];
        for buffer in &self.extra {
            results.push((buffer.handle().name(), buffer.unlink()));
        }
        for (name, result) in results {
            if let Err(e) = result {
                warn!("[SHM] Failed to unlink {}: {}", name, e);
            }
        }
    }
}

/// Everything a manager host needs before its thread starts
#[derive(Debug, Clone)]
pub struct SharedResources {
    pub role: Role,
    pub handles: BufferHandles,
    pub config: Arc<ScopeConfig>,
    pub channel: ManagerEnd,
}

impl SharedResources {
    pub fn new(role: Role, handles: BufferHandles, config: Arc<ScopeConfig>, channel: ManagerEnd) -> Self {
        Self {
            role,
            handles,
            config,
            channel,
        }
    }
}
