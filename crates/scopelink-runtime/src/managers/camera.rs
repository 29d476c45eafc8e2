// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Camera manager
//!
//! Moves camera stacks into the video buffer and hands frame buffers back
//! to the driver once the pool is done with them. When the video buffer is
//! one slot from full it purges down to the configured low-water level and
//! tells presentation about it.

use scopelink_buffers::{BufferError, PoolFlag, PoolState, StackGeometry, VideoBuffer};
use scopelink_ipc::{Command, CommandKind, Role};
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{HandlerTable, ManagerContext, ManagerProcess};

/// One complete stack of raw camera bytes
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedStack {
    pub data: Vec<u8>,
    pub timestamp: f64,
}

/// Camera driver
pub trait Camera: Send + 'static {
    fn connect(&mut self, geometry: StackGeometry) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Next complete stack, if the camera has one ready at `now`
    fn fetch(&mut self, now: f64) -> Result<Option<CapturedStack>>;

    /// Hand `frames` frame buffers back to the driver
    fn release(&mut self, frames: usize);

    fn settings(&self) -> Vec<String>;

    fn get_setting(&self, name: &str) -> Result<String>;

    fn set_setting(&mut self, name: &str, value: &str) -> Result<()>;
}

/// Synthetic camera producing a moving test pattern
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    geometry: Option<StackGeometry>,
    framerate: f64,
    exposure: f64,
    gain: u32,
    last_time: f64,
    stacks: u64,
    released: usize,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self {
            geometry: None,
            framerate: 1000.0,
            exposure: 25_000.0,
            gain: 0,
            last_time: f64::NEG_INFINITY,
            stacks: 0,
            released: 0,
        }
    }
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame buffers released back so far
    pub fn released(&self) -> usize {
        self.released
    }

    /// Stacks produced so far
    pub fn stacks(&self) -> u64 {
        self.stacks
    }

    fn render(&self, geometry: &StackGeometry) -> Vec<u8> {
        let bytes_per_pixel = geometry.bytes_per_pixel();
        let max = if geometry.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << geometry.bits) - 1
        };
        let level = (self.exposure as u64).saturating_mul(u64::from(self.gain) + 1);
        let pixels = geometry.stack_depth * geometry.height * geometry.width;
        let mut data = Vec::with_capacity(geometry.stack_bytes());
        for i in 0..pixels {
            let value = (level.wrapping_add(i as u64).wrapping_add(self.stacks)) % (max.min(4096) + 1);
            data.extend_from_slice(&value.to_le_bytes()[..bytes_per_pixel]);
        }
        data
    }
}

impl Camera for SimulatedCamera {
    fn connect(&mut self, geometry: StackGeometry) -> Result<()> {
        self.geometry = Some(geometry);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.geometry.is_some()
    }

    fn fetch(&mut self, now: f64) -> Result<Option<CapturedStack>> {
        let Some(geometry) = self.geometry else {
            return Ok(None);
        };
        if now - self.last_time < geometry.stack_depth as f64 / self.framerate {
            return Ok(None);
        }
        self.last_time = now;
        let data = self.render(&geometry);
        self.stacks += 1;
        Ok(Some(CapturedStack { data, timestamp: now }))
    }

    fn release(&mut self, frames: usize) {
        self.released += frames;
    }

    fn settings(&self) -> Vec<String> {
        vec!["framerate".to_string(), "exposure".to_string(), "gain".to_string()]
    }

    fn get_setting(&self, name: &str) -> Result<String> {
        match name {
            "framerate" => Ok(format!("{}", self.framerate.round())),
            "exposure" => Ok(format!("{}", self.exposure.round())),
            "gain" => Ok(self.gain.to_string()),
            other => Err(ManagerError::Camera(format!("Unknown setting '{}'", other))),
        }
    }

    fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        let invalid = || ManagerError::Camera(format!("Invalid value '{}' for {}", value, name));
        match name {
            "framerate" => {
                let v: f64 = value.parse().map_err(|_| invalid())?;
                if !(1.0..=10_000.0).contains(&v) {
                    return Err(invalid());
                }
                self.framerate = v;
            }
            "exposure" => {
                let v: f64 = value.parse().map_err(|_| invalid())?;
                if !(0.0..=10_000_000.0).contains(&v) {
                    return Err(invalid());
                }
                self.exposure = v;
            }
            "gain" => {
                let v: u32 = value.parse().map_err(|_| invalid())?;
                if v > 10 {
                    return Err(invalid());
                }
                self.gain = v;
            }
            other => return Err(ManagerError::Camera(format!("Unknown setting '{}'", other))),
        }
        Ok(())
    }
}

pub struct CameraManager<C: Camera> {
    camera: C,
    video: Option<VideoBuffer>,
    pool_flag: Option<PoolFlag>,
    purges: u64,
}

impl<C: Camera> CameraManager<C> {
    pub fn new(camera: C) -> Self {
        Self {
            camera,
            video: None,
            pool_flag: None,
            purges: 0,
        }
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Low-water purges performed so far
    pub fn purges(&self) -> u64 {
        self.purges
    }

    fn video(&self) -> Result<&VideoBuffer> {
        self.video
            .as_ref()
            .ok_or_else(|| ManagerError::MissingResource("video buffer".to_string()))
    }

    fn publish_setting(&self, ctx: &ManagerContext, name: &str) {
        match self.camera.get_setting(name) {
            Ok(value) => {
                ctx.notify(Command::CameraSettingChanged {
                    name: name.to_string(),
                    value,
                });
            }
            Err(e) => warn!("[CAMERA] Could not read setting {}: {}", name, e),
        }
    }

    fn publish_settings(&self, ctx: &ManagerContext) {
        for name in self.camera.settings() {
            self.publish_setting(ctx, &name);
        }
    }

    /// Drop oldest stacks until the buffer is at or below `low_water`
    fn purge(&mut self, ctx: &ManagerContext) -> Result<()> {
        let low_water = ctx.config().buffers.low_water;
        let video = self.video()?;
        let depth = video.geometry().stack_depth;
        let mut dropped = 0;
        while video.get_level() > low_water {
            if video.discard(1) == 0 {
                break;
            }
            dropped += 1;
        }
        if dropped == 0 {
            return Ok(());
        }
        self.camera.release(dropped * depth);
        self.purges += 1;
        warn!("[CAMERA] Video buffer nearly full, purged {} stack(s)", dropped);
        ctx.notify(Command::VideoBufferPurged { at: ctx.now() });
        Ok(())
    }

    fn on_set_camera_setting(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::SetCameraSetting { name, value } = command {
            if let Err(e) = self.camera.set_setting(&name, &value) {
                warn!("[CAMERA] Could not set {} to {}: {}", name, value, e);
            }
            self.publish_settings(ctx);
        }
        Ok(())
    }

    fn on_get_camera_setting(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::GetCameraSetting { name } = command {
            self.publish_setting(ctx, &name);
        }
        Ok(())
    }
}

impl<C: Camera> ManagerProcess for CameraManager<C> {
    fn role(&self) -> Role {
        Role::Camera
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
            .on(CommandKind::SetCameraSetting, "set_camera_setting", Self::on_set_camera_setting)
            .on(CommandKind::GetCameraSetting, "get_camera_setting", Self::on_get_camera_setting)
    }

    fn setup(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        let video = ctx.attach_video()?;
        self.pool_flag = Some(ctx.attach_pool_flag()?);
        match self.camera.connect(video.geometry()) {
            Ok(()) => info!("[CAMERA] Connected, stack shape {:?}", video.geometry().shape()),
            Err(e) => warn!("[CAMERA] Could not connect to camera: {}", e),
        }
        self.video = Some(video);
        if self.camera.is_connected() {
            self.publish_settings(ctx);
        }
        Ok(())
    }

    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        let depth = self.video()?.geometry().stack_depth;
        let flag = self
            .pool_flag
            .as_ref()
            .ok_or_else(|| ManagerError::MissingResource("pool flag".to_string()))?;

        match flag.state()? {
            PoolState::Finished => {
                self.camera.release(depth);
                flag.recycle()?;
            }
            PoolState::Idle if !ctx.acquisition().on => {
                // Nobody will process these, give the frames back
                let discarded = self.video()?.discard(1);
                if discarded > 0 {
                    self.camera.release(depth);
                }
            }
            _ => {}
        }

        let free_slots = self.video()?.ring().free_slots();
        if free_slots <= 1 {
            self.purge(ctx)?;
        }

        if !self.camera.is_connected() {
            return Ok(());
        }
        let Some(stack) = self.camera.fetch(ctx.now())? else {
            return Ok(());
        };
        let policy = ctx.overflow_policy();
        let written = self.video()?.write_stack_bytes(&stack.data, stack.timestamp, policy);
        match written {
            Ok(outcome) if outcome.dropped() > 0 => {
                self.camera.release(outcome.dropped() * depth);
                ctx.notify(Command::VideoBufferPurged { at: ctx.now() });
            }
            Ok(_) => debug!("[CAMERA] Stored stack at {:.3}", stack.timestamp),
            Err(BufferError::Overflow { .. }) => {
                warn!("[CAMERA] Video buffer full, dropped stack at {:.3}", stack.timestamp);
                self.camera.release(depth);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn teardown(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
        if let Some(video) = &self.video {
            let leftover = video.len();
            self.camera.release(leftover * video.geometry().stack_depth);
        }
        Ok(())
    }
}
