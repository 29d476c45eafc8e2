// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Worker pool manager
//!
//! Producer side of the pool: whenever the pool is idle and a full stack is
//! waiting, it reads the stack, begins a cycle and queues a [`StackTask`].
//! The tracking itself is a [`StackProcessor`] supplied by the embedding
//! application; the rows it returns land in the tracks buffer.

use ndarray::{Array2, Array3};
use scopelink_buffers::{MatrixBuffer, OverflowPolicy, Pixel, PoolFlag, PoolState, StackGeometry, VideoBuffer};
use scopelink_ipc::{BeadRoi, Role};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{ManagerError, Result};
use crate::manager::{HandlerTable, ManagerContext, ManagerProcess};
use crate::pool::{PoolTask, WorkerPool};
use crate::resources::{track_col, TRACK_COLUMNS};

/// One stack copied out of the video buffer
#[derive(Debug, Clone)]
pub struct Stack {
    pub data: Vec<u8>,
    pub geometry: StackGeometry,
    pub timestamp: f64,
}

impl Stack {
    /// Decode the raw bytes as (frame, y, x) pixels
    pub fn pixels<T: Pixel>(&self) -> Result<Array3<T>> {
        if T::BITS != self.geometry.bits {
            return Err(ManagerError::Buffer(scopelink_buffers::BufferError::ShapeMismatch {
                expected: format!("{}-bit pixels", self.geometry.bits),
                actual: format!("{}-bit pixels", T::BITS),
            }));
        }
        let pixels: Vec<T> = bytemuck::pod_collect_to_vec(&self.data);
        Array3::from_shape_vec(self.geometry.shape(), pixels).map_err(|e| {
            ManagerError::Buffer(scopelink_buffers::BufferError::ShapeMismatch {
                expected: format!("{:?}", self.geometry.shape()),
                actual: e.to_string(),
            })
        })
    }
}

/// Tracking collaborator
pub trait StackProcessor: Send + Sync + 'static {
    /// Whether processing needs the exclusive hardware context
    fn needs_exclusive(&self) -> bool {
        false
    }

    /// Track rows for `stack`, shaped `(n, TRACK_COLUMNS)`
    fn process(&self, stack: &Stack, rois: &BTreeMap<u32, BeadRoi>) -> Result<Array2<f64>>;
}

/// Placeholder tracker reporting every bead at the centre of its ROI
///
/// Produces one row per bead per stack in the tracks layout, with positions
/// in nanometres. Useful for exercising the pipeline without a real tracker.
#[derive(Debug, Clone)]
pub struct StaticRoiProcessor {
    pub nm_per_px: f64,
}

impl StackProcessor for StaticRoiProcessor {
    fn process(&self, stack: &Stack, rois: &BTreeMap<u32, BeadRoi>) -> Result<Array2<f64>> {
        let mut rows = Array2::zeros((rois.len(), TRACK_COLUMNS));
        for (i, (id, roi)) in rois.iter().enumerate() {
            let (cx, cy) = roi.center();
            rows[[i, track_col::T]] = stack.timestamp;
            rows[[i, track_col::X]] = cx * self.nm_per_px;
            rows[[i, track_col::Y]] = cy * self.nm_per_px;
            rows[[i, track_col::Z]] = 0.0;
            rows[[i, track_col::BEAD_ID]] = f64::from(*id);
            rows[[i, track_col::ROI_X]] = f64::from(roi.x0);
            rows[[i, track_col::ROI_Y]] = f64::from(roi.y0);
        }
        Ok(rows)
    }
}

/// Pool task running the processor on one stack
pub struct StackTask {
    processor: Arc<dyn StackProcessor>,
    stack: Stack,
    rois: BTreeMap<u32, BeadRoi>,
    tracks: Arc<MatrixBuffer>,
    policy: OverflowPolicy,
}

impl PoolTask for StackTask {
    fn name(&self) -> &str {
        "track_stack"
    }

    fn needs_exclusive(&self) -> bool {
        self.processor.needs_exclusive()
    }

    fn run(&mut self) -> Result<()> {
        let rows = self.processor.process(&self.stack, &self.rois)?;
        if rows.nrows() == 0 {
            return Ok(());
        }
        let outcome = self.tracks.write_rows(rows.view(), self.stack.timestamp, self.policy)?;
        if outcome.dropped() > 0 {
            debug!("[POOL] Tracks buffer purged {} row(s)", outcome.dropped());
        }
        Ok(())
    }
}

pub struct WorkerPoolManager {
    processor: Arc<dyn StackProcessor>,
    pool: Option<WorkerPool>,
    video: Option<VideoBuffer>,
    tracks: Option<Arc<MatrixBuffer>>,
    flag: Option<Arc<PoolFlag>>,
    cycles: u64,
}

impl WorkerPoolManager {
    pub fn new(processor: Arc<dyn StackProcessor>) -> Self {
        Self {
            processor,
            pool: None,
            video: None,
            tracks: None,
            flag: None,
            cycles: 0,
        }
    }

    /// Cycles submitted so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn missing(what: &str) -> ManagerError {
        ManagerError::MissingResource(what.to_string())
    }

    fn report_failures(&self, ctx: &ManagerContext) {
        let Some(pool) = &self.pool else {
            return;
        };
        for failure in pool.take_failures() {
            if let Err(e) = ctx.send(failure.into_command()) {
                error!("[POOL] Could not report task failure: {}", e);
            }
        }
    }
}

impl ManagerProcess for WorkerPoolManager {
    fn role(&self) -> Role {
        Role::WorkerPool
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
    }

    fn setup(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        let flag = Arc::new(ctx.attach_pool_flag()?);
        let exclusive = Arc::new(ctx.attach_gpu_lock()?);
        self.video = Some(ctx.attach_video()?);
        self.tracks = Some(Arc::new(ctx.attach_tracks()?));
        let pool_config = &ctx.config().pool;
        self.pool = Some(WorkerPool::start(
            pool_config.workers,
            pool_config.queue_capacity,
            Arc::clone(&flag),
            exclusive,
        )?);
        self.flag = Some(flag);
        info!("[POOL] Pool manager ready");
        Ok(())
    }

    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        self.report_failures(ctx);
        if !ctx.acquisition().on {
            return Ok(());
        }
        let flag = self.flag.as_ref().ok_or_else(|| Self::missing("pool flag"))?;
        if flag.state()? != PoolState::Idle {
            return Ok(());
        }
        let video = self.video.as_ref().ok_or_else(|| Self::missing("video buffer"))?;
        if !video.check_read_stack() {
            return Ok(());
        }

        let record = video.read_stack_bytes()?;
        let task = StackTask {
            processor: Arc::clone(&self.processor),
            stack: Stack {
                data: record.data,
                geometry: video.geometry(),
                timestamp: record.timestamp,
            },
            rois: ctx.acquisition().bead_rois.clone(),
            tracks: Arc::clone(self.tracks.as_ref().ok_or_else(|| Self::missing("tracks buffer"))?),
            policy: ctx.overflow_policy(),
        };
        let pool = self.pool.as_ref().ok_or_else(|| Self::missing("worker pool"))?;
        let cycle = pool.submit_cycle(vec![Box::new(task)])?;
        self.cycles += 1;
        debug!("[POOL] Submitted cycle {}", cycle);
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        if let Some(mut pool) = self.pool.take() {
            pool.stop();
        }
        self.report_failures(ctx);
        Ok(())
    }
}
