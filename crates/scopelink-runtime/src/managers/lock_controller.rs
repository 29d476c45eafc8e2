// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lock controller
//!
//! Two rate-limited correction loops over the tracks buffer:
//!
//! - **XY**: keeps every tracked bead centred in its ROI by asking
//!   presentation to move ROIs (`MoveBeads`). A bead with a correction in
//!   flight is skipped until `RemoveBeadsFromPendingMoves` names it.
//! - **Z**: holds one reference bead at a target height by moving the focus
//!   actuator (`MoveFocus`), one move at a time until `FocusMoveCompleted`.
//!
//! Both loops take "now" as a parameter so they can be driven with
//! synthetic time.

use ahash::{AHashMap, AHashSet};
use ndarray::{Array2, ArrayView1};
use scopelink_buffers::MatrixBuffer;
use scopelink_ipc::{BeadMove, Command, CommandKind, Role};
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{HandlerTable, ManagerContext, ManagerProcess};
use crate::resources::track_col;

/// Clamp, round and threshold a single-axis correction
///
/// Returns `None` when `deviation` is below `min_step` or rounds to zero.
pub fn axis_correction(deviation: f64, max_step: f64, min_step: f64, resolution: f64) -> Option<f64> {
    if !deviation.is_finite() || deviation.abs() < min_step {
        return None;
    }
    let step = round_to(clamp(deviation, max_step), resolution);
    (step != 0.0).then_some(step)
}

/// Two-axis correction in pixels
///
/// The threshold applies to the larger axis; each axis is then clamped to
/// `max_step` and rounded to `resolution` independently.
pub fn xy_correction(
    dev_x: f64,
    dev_y: f64,
    max_step: f64,
    min_step: f64,
    resolution: f64,
) -> Option<(f64, f64)> {
    if !dev_x.is_finite() || !dev_y.is_finite() || dev_x.abs().max(dev_y.abs()) < min_step {
        return None;
    }
    let dx = round_to(clamp(dev_x, max_step), resolution);
    let dy = round_to(clamp(dev_y, max_step), resolution);
    if dx == 0.0 && dy == 0.0 {
        None
    } else {
        Some((dx, dy))
    }
}

fn clamp(value: f64, max_step: f64) -> f64 {
    value.abs().min(max_step).copysign(value)
}

fn round_to(value: f64, resolution: f64) -> f64 {
    if resolution > 0.0 {
        (value / resolution).round() * resolution
    } else {
        value
    }
}

/// Newest row per bead id within `rows`
fn latest_per_bead(rows: &Array2<f64>) -> AHashMap<u32, ArrayView1<'_, f64>> {
    let mut latest: AHashMap<u32, ArrayView1<'_, f64>> = AHashMap::new();
    for row in rows.rows() {
        let id = row[track_col::BEAD_ID];
        if !id.is_finite() || id < 0.0 {
            continue;
        }
        let id = id as u32;
        match latest.get(&id) {
            Some(existing) if existing[track_col::T] >= row[track_col::T] => {}
            _ => {
                latest.insert(id, row);
            }
        }
    }
    latest
}

#[derive(Debug, Clone)]
struct XyLoop {
    enabled: bool,
    interval: f64,
    max_step: f64,
    window: usize,
    last_run: f64,
    pending: AHashSet<u32>,
}

#[derive(Debug, Clone)]
struct ZLoop {
    enabled: bool,
    bead: u32,
    target: f64,
    interval: f64,
    max_step: f64,
    last_run: f64,
    pending: bool,
}

pub struct LockController {
    tracks: Option<MatrixBuffer>,
    xy: XyLoop,
    z: ZLoop,
}

impl Default for LockController {
    fn default() -> Self {
        Self::new()
    }
}

impl LockController {
    pub fn new() -> Self {
        Self {
            tracks: None,
            xy: XyLoop {
                enabled: false,
                interval: 10.0,
                max_step: 10.0,
                window: 1000,
                last_run: f64::NEG_INFINITY,
                pending: AHashSet::new(),
            },
            z: ZLoop {
                enabled: false,
                bead: 0,
                target: 0.0,
                interval: 10.0,
                max_step: 1000.0,
                last_run: f64::NEG_INFINITY,
                pending: false,
            },
        }
    }

    /// Bead ids with an unacknowledged XY correction, sorted
    pub fn pending_beads(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.xy.pending.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn focus_move_pending(&self) -> bool {
        self.z.pending
    }

    fn tracks(&self) -> Result<&MatrixBuffer> {
        self.tracks
            .as_ref()
            .ok_or_else(|| ManagerError::MissingResource("tracks buffer".to_string()))
    }

    /// Run both loops if their interval has elapsed at `now`
    pub fn tick(&mut self, ctx: &mut ManagerContext, now: f64) -> Result<()> {
        if self.xy.enabled && now - self.xy.last_run >= self.xy.interval {
            self.run_xy(ctx, now)?;
        }
        if self.z.enabled && now - self.z.last_run >= self.z.interval {
            self.run_z(ctx, now)?;
        }
        Ok(())
    }

    /// One XY pass at `now`, regardless of interval or enable flag
    pub fn run_xy(&mut self, ctx: &mut ManagerContext, now: f64) -> Result<()> {
        self.xy.last_run = now;
        let settings = &ctx.config().xy_lock;
        let (min_step, resolution, stale_after) = (settings.min_step, settings.resolution, settings.stale_after_s);
        let nm_per_px = ctx.config().camera.nm_per_px;
        let radius = f64::from(ctx.config().camera.roi) / 2.0;

        let rows = self.tracks()?.latest_rows(self.xy.window);
        let latest = latest_per_bead(&rows);
        let mut moves = Vec::new();
        for id in ctx.acquisition().bead_rois.keys() {
            if self.xy.pending.contains(id) {
                continue;
            }
            let Some(row) = latest.get(id) else {
                continue;
            };
            if now - row[track_col::T] > stale_after {
                continue;
            }
            let (x, y) = (row[track_col::X], row[track_col::Y]);
            if x.is_nan() || y.is_nan() {
                continue;
            }
            let dev_x = x / nm_per_px - radius - row[track_col::ROI_X];
            let dev_y = y / nm_per_px - radius - row[track_col::ROI_Y];
            if let Some((dx, dy)) = xy_correction(dev_x, dev_y, self.xy.max_step, min_step, resolution) {
                moves.push(BeadMove { bead_id: *id, dx, dy });
            }
        }
        if moves.is_empty() {
            return Ok(());
        }
        let ids: Vec<u32> = moves.iter().map(|m| m.bead_id).collect();
        debug!("[LOCK] XY correcting {} bead(s)", ids.len());
        ctx.send(Command::MoveBeads { moves })?;
        self.xy.pending.extend(ids);
        Ok(())
    }

    /// One Z pass at `now`, regardless of interval or enable flag
    pub fn run_z(&mut self, ctx: &mut ManagerContext, now: f64) -> Result<()> {
        self.z.last_run = now;
        if self.z.pending {
            return Ok(());
        }
        let settings = &ctx.config().z_lock;
        let (min_step, resolution, stale_after) = (settings.min_step, settings.resolution, settings.stale_after_s);

        let rows = self.tracks()?.latest_rows(self.xy.window);
        let latest = latest_per_bead(&rows);
        let Some(row) = latest.get(&self.z.bead) else {
            return Ok(());
        };
        let z = row[track_col::Z];
        if now - row[track_col::T] > stale_after || z.is_nan() {
            return Ok(());
        }
        let Some(dz) = axis_correction(self.z.target - z, self.z.max_step, min_step, resolution) else {
            return Ok(());
        };

        debug!("[LOCK] Z correcting by {} nm", dz);
        ctx.send(Command::MoveFocus { dz })?;
        self.z.pending = true;
        Ok(())
    }

    fn on_remove_pending(&mut self, _ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::RemoveBeadsFromPendingMoves { ids } = command {
            for id in ids {
                self.xy.pending.remove(&id);
            }
        }
        Ok(())
    }

    fn on_focus_move_completed(&mut self, _ctx: &mut ManagerContext, _command: Command) -> Result<()> {
        self.z.pending = false;
        Ok(())
    }

    fn on_execute_xy_lock(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        if let Command::ExecuteXyLock { now } = command {
            let now = now.unwrap_or_else(|| ctx.now());
            self.run_xy(ctx, now)?;
        }
        Ok(())
    }

    fn on_tunable(&mut self, _ctx: &mut ManagerContext, command: Command) -> Result<()> {
        match command {
            Command::SetXyLockOn { value } => self.xy.enabled = value,
            Command::SetXyLockInterval { value } => self.xy.interval = value,
            Command::SetXyLockMax { value } => self.xy.max_step = value,
            Command::SetXyLockWindow { value } => self.xy.window = value as usize,
            Command::SetZLockOn { value } => self.z.enabled = value,
            Command::SetZLockBead { value } => self.z.bead = value,
            Command::SetZLockTarget { value } => self.z.target = value,
            Command::SetZLockInterval { value } => self.z.interval = value,
            Command::SetZLockMax { value } => self.z.max_step = value,
            other => {
                return Err(ManagerError::Handler {
                    command: other.kind(),
                    reason: "not a lock tunable".to_string(),
                })
            }
        }
        Ok(())
    }
}

impl ManagerProcess for LockController {
    fn role(&self) -> Role {
        Role::LockController
    }

    fn handlers(&self) -> HandlerTable<Self> {
        HandlerTable::new()
            .on(CommandKind::RemoveBeadsFromPendingMoves, "remove_beads_from_pending_moves", Self::on_remove_pending)
            .on(CommandKind::FocusMoveCompleted, "focus_move_completed", Self::on_focus_move_completed)
            .on(CommandKind::ExecuteXyLock, "execute_xy_lock", Self::on_execute_xy_lock)
            .on(CommandKind::SetXyLockOn, "set_xy_lock_on", Self::on_tunable)
            .on(CommandKind::SetXyLockInterval, "set_xy_lock_interval", Self::on_tunable)
            .on(CommandKind::SetXyLockMax, "set_xy_lock_max", Self::on_tunable)
            .on(CommandKind::SetXyLockWindow, "set_xy_lock_window", Self::on_tunable)
            .on(CommandKind::SetZLockOn, "set_z_lock_on", Self::on_tunable)
            .on(CommandKind::SetZLockBead, "set_z_lock_bead", Self::on_tunable)
            .on(CommandKind::SetZLockTarget, "set_z_lock_target", Self::on_tunable)
            .on(CommandKind::SetZLockInterval, "set_z_lock_interval", Self::on_tunable)
            .on(CommandKind::SetZLockMax, "set_z_lock_max", Self::on_tunable)
    }

    fn setup(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        self.tracks = Some(ctx.attach_tracks()?);
        let xy = &ctx.config().xy_lock;
        self.xy.enabled = xy.enabled;
        self.xy.interval = xy.interval_s;
        self.xy.max_step = xy.max_step;
        self.xy.window = xy.window;
        let z = &ctx.config().z_lock;
        self.z.enabled = z.enabled;
        self.z.bead = z.bead;
        self.z.target = z.target;
        self.z.interval = z.interval_s;
        self.z.max_step = z.max_step;

        let actuator = Role::Hardware(z.actuator.clone());
        let routed = ctx
            .registry()
            .route(CommandKind::MoveFocus)
            .map(|route| route.handlers.iter().any(|(role, _)| *role == actuator))
            .unwrap_or(false);
        if !routed {
            warn!("[LOCK] Focus actuator {} does not handle MoveFocus; Z lock cannot act", actuator);
        }
        info!(
            "[LOCK] XY lock {}, Z lock {} (bead {}, target {} nm)",
            if self.xy.enabled { "on" } else { "off" },
            if self.z.enabled { "on" } else { "off" },
            self.z.bead,
            self.z.target
        );
        Ok(())
    }

    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        let now = ctx.now();
        self.tick(ctx, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerStatus;
    use crate::resources::TRACK_COLUMNS;
    use crate::test_support::{harness_with, small_config};
    use scopelink_buffers::OverflowPolicy;
    use scopelink_ipc::{BeadRoi, CommandRegistry};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry
            .register(Role::Presentation, CommandKind::MoveBeads, "move_beads")
            .unwrap();
        registry
            .register(Role::Hardware("focus".into()), CommandKind::MoveFocus, "move_focus")
            .unwrap();
        registry
    }

    fn row(t: f64, x_px: f64, y_px: f64, z: f64, id: u32, roi_x: f64, roi_y: f64, nm_per_px: f64) -> Vec<f64> {
        let mut row = vec![0.0; TRACK_COLUMNS];
        row[track_col::T] = t;
        row[track_col::X] = x_px * nm_per_px;
        row[track_col::Y] = y_px * nm_per_px;
        row[track_col::Z] = z;
        row[track_col::BEAD_ID] = f64::from(id);
        row[track_col::ROI_X] = roi_x;
        row[track_col::ROI_Y] = roi_y;
        row
    }

    #[test]
    fn test_xy_clamp_and_round() {
        let (dx, dy) = xy_correction(3.4, -0.2, 2.0, 1.0, 0.1).unwrap();
        assert!((dx - 2.0).abs() < 1e-9);
        assert!((dy + 0.2).abs() < 1e-9);

        // Coarse device resolution rounds the small axis away
        assert_eq!(xy_correction(3.4, -0.2, 2.0, 1.0, 1.0), Some((2.0, -0.0)));
        assert_eq!(xy_correction(0.9, -0.5, 2.0, 1.0, 0.1), None);
        assert_eq!(xy_correction(f64::NAN, 5.0, 2.0, 1.0, 0.1), None);
    }

    #[test]
    fn test_axis_correction() {
        assert_eq!(axis_correction(-1500.0, 1000.0, 10.0, 1.0), Some(-1000.0));
        assert_eq!(axis_correction(5.0, 1000.0, 10.0, 1.0), None);
        assert_eq!(axis_correction(12.4, 1000.0, 10.0, 1.0), Some(12.0));
    }

    #[test]
    fn test_xy_pass_emits_and_blocks_until_acknowledged() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let nm_per_px = config.camera.nm_per_px;
        let radius = f64::from(config.camera.roi) / 2.0;
        let (resources, router_end, buffers) =
            harness_with(Role::LockController, &config, registry(), &[]);

        let now = 100.0;
        // Bead 1 sits 3.4 px right of centre, bead 2 only 0.5 px off
        let rows = [
            row(now - 0.5, 10.0 + radius + 1.0, 20.0 + radius, 0.0, 1, 10.0, 20.0, nm_per_px),
            row(now - 0.1, 10.0 + radius + 3.4, 20.0 + radius - 0.2, 0.0, 1, 10.0, 20.0, nm_per_px),
            row(now - 0.1, 40.0 + radius + 0.5, 40.0 + radius, 0.0, 2, 40.0, 40.0, nm_per_px),
        ];
        for r in &rows {
            buffers.tracks().write_row(r, now, OverflowPolicy::Strict).unwrap();
        }

        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut rois = BTreeMap::new();
        rois.insert(1, BeadRoi::new(10, 36, 20, 46));
        rois.insert(2, BeadRoi::new(40, 66, 40, 66));
        ctx.apply_builtin(&Command::SetBeadRois { rois });

        let mut controller = LockController::new();
        controller.setup(&mut ctx).unwrap();
        controller.run_xy(&mut ctx, now).unwrap();

        match router_end.try_recv().unwrap().unwrap().payload {
            Command::MoveBeads { moves } => {
                assert_eq!(moves.len(), 1);
                assert_eq!(moves[0].bead_id, 1);
                // Default max_step 10, resolution 1
                assert!((moves[0].dx - 3.0).abs() < 1e-9);
                assert_eq!(moves[0].dy, -0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(controller.pending_beads(), vec![1]);

        // Pending bead is not corrected again
        controller.run_xy(&mut ctx, now).unwrap();
        assert_eq!(router_end.try_recv().unwrap(), None);

        controller
            .on_remove_pending(&mut ctx, Command::RemoveBeadsFromPendingMoves { ids: vec![1] })
            .unwrap();
        controller.run_xy(&mut ctx, now).unwrap();
        assert!(router_end.try_recv().unwrap().is_some());

        // Stale rows are ignored
        controller
            .on_remove_pending(&mut ctx, Command::RemoveBeadsFromPendingMoves { ids: vec![1] })
            .unwrap();
        controller.run_xy(&mut ctx, now + 5.0).unwrap();
        assert_eq!(router_end.try_recv().unwrap(), None);
    }

    #[test]
    fn test_interval_rate_limits_loops() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.z_lock.stale_after_s = 100.0;
        let (resources, router_end, buffers) =
            harness_with(Role::LockController, &config, registry(), &[]);
        buffers
            .tracks()
            .write_row(&row(50.0, 0.0, 0.0, 400.0, 0, 0.0, 0.0, 1.0), 50.0, OverflowPolicy::Strict)
            .unwrap();

        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut controller = LockController::new();
        controller.setup(&mut ctx).unwrap();
        for command in [
            Command::SetZLockOn { value: true },
            Command::SetZLockInterval { value: 2.0 },
            Command::SetZLockTarget { value: 1000.0 },
            Command::SetZLockMax { value: 250.0 },
        ] {
            controller.on_tunable(&mut ctx, command).unwrap();
        }

        controller.tick(&mut ctx, 50.1).unwrap();
        assert_eq!(
            router_end.try_recv().unwrap().unwrap().payload,
            Command::MoveFocus { dz: 250.0 }
        );
        assert!(controller.focus_move_pending());

        controller.on_focus_move_completed(&mut ctx, Command::FocusMoveCompleted).unwrap();
        // Within the interval nothing runs
        controller.tick(&mut ctx, 51.0).unwrap();
        assert_eq!(router_end.try_recv().unwrap(), None);
        controller.tick(&mut ctx, 53.0).unwrap();
        assert!(matches!(
            router_end.try_recv().unwrap().unwrap().payload,
            Command::MoveFocus { .. }
        ));

        assert!(controller.on_tunable(&mut ctx, Command::FocusMoveCompleted).is_err());
    }
}
