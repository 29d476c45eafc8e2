// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware managers
//!
//! [`HardwareManager`] hosts one user device under `Role::Hardware(name)`.
//! The device declares its telemetry width and the commands it accepts; the
//! manager allocates a matrix buffer for the telemetry, polls the device each
//! iteration and forwards accepted commands to it.

use scopelink_buffers::MatrixBuffer;
use scopelink_ipc::{Command, CommandKind, Role};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, Result};
use crate::manager::{HandlerTable, ManagerContext, ManagerProcess};
use crate::resources::BufferRequest;

/// What a device produced during one call
#[derive(Debug, Default)]
pub struct DeviceOutput {
    rows: Vec<Vec<f64>>,
    notifications: Vec<Command>,
}

impl DeviceOutput {
    /// Queue a telemetry row; its width must match `buffer_columns`
    pub fn push_row(&mut self, row: Vec<f64>) {
        self.rows.push(row);
    }

    /// Queue a command to send once the call returns
    pub fn notify(&mut self, command: Command) {
        self.notifications.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.notifications.is_empty()
    }
}

/// Device driver hosted by a [`HardwareManager`]
pub trait HardwareDevice: Send + 'static {
    /// Role name; the manager runs as `Role::Hardware(name)`
    fn name(&self) -> &str;

    fn buffer_columns(&self) -> usize;

    fn buffer_rows(&self) -> usize {
        1000
    }

    /// `(kind, handler name)` pairs the device handles
    fn accepted_commands(&self) -> Vec<(CommandKind, &'static str)>;

    fn connect(&mut self) -> Result<()>;

    /// Poll the device
    fn fetch(&mut self, now: f64, out: &mut DeviceOutput) -> Result<()>;

    fn handle(&mut self, command: Command, now: f64, out: &mut DeviceOutput) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

pub struct HardwareManager<D: HardwareDevice> {
    device: D,
    buffer: Option<MatrixBuffer>,
    connected: bool,
}

impl<D: HardwareDevice> HardwareManager<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            buffer: None,
            connected: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn flush(&self, ctx: &ManagerContext, out: DeviceOutput, now: f64) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            for row in &out.rows {
                let outcome = buffer.write_row(row, now, ctx.overflow_policy())?;
                if outcome.dropped() > 0 {
                    debug!("[HARDWARE] {} buffer dropped {} row(s)", self.device.name(), outcome.dropped());
                }
            }
        }
        for command in out.notifications {
            ctx.notify(command);
        }
        Ok(())
    }

    fn on_device_command(&mut self, ctx: &mut ManagerContext, command: Command) -> Result<()> {
        let now = ctx.now();
        let mut out = DeviceOutput::default();
        self.device.handle(command, now, &mut out)?;
        self.flush(ctx, out, now)
    }
}

impl<D: HardwareDevice> ManagerProcess for HardwareManager<D> {
    fn role(&self) -> Role {
        Role::Hardware(self.device.name().to_string())
    }

    fn handlers(&self) -> HandlerTable<Self> {
        self.device
            .accepted_commands()
            .into_iter()
            .fold(HandlerTable::new(), |table, (kind, name)| {
                table.on(kind, name, Self::on_device_command)
            })
    }

    fn buffer_requests(&self) -> Vec<BufferRequest> {
        vec![BufferRequest {
            name: self.device.name().to_string(),
            rows: self.device.buffer_rows(),
            n_cols: self.device.buffer_columns(),
        }]
    }

    fn setup(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        self.buffer = Some(ctx.attach_extra(self.device.name())?);
        match self.device.connect() {
            Ok(()) => {
                self.connected = true;
                info!("[HARDWARE] {} connected", self.device.name());
            }
            Err(e) => warn!("[HARDWARE] {} failed to connect: {}", self.device.name(), e),
        }
        Ok(())
    }

    fn do_main_loop(&mut self, ctx: &mut ManagerContext) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let now = ctx.now();
        let mut out = DeviceOutput::default();
        self.device.fetch(now, &mut out)?;
        self.flush(ctx, out, now)
    }

    fn teardown(&mut self, _ctx: &mut ManagerContext) -> Result<()> {
        if self.connected {
            self.connected = false;
            self.device.disconnect()?;
        }
        Ok(())
    }
}

/// Focus actuator that slews toward its target at a fixed speed
///
/// Telemetry rows are `t, position, target` in nanometres. Reports
/// `FocusMoveCompleted` when a requested move arrives.
#[derive(Debug, Clone)]
pub struct SimulatedFocusMotor {
    position: f64,
    target: f64,
    /// Nanometres per second
    speed: f64,
    moving: bool,
    last_fetch: Option<f64>,
    connected: bool,
    /// Bus latency simulated on every fetch
    fetch_delay: Duration,
}

impl Default for SimulatedFocusMotor {
    fn default() -> Self {
        Self::new(10_000.0)
    }
}

impl SimulatedFocusMotor {
    pub fn new(speed: f64) -> Self {
        Self {
            position: 0.0,
            target: 0.0,
            speed,
            moving: false,
            last_fetch: None,
            connected: false,
            fetch_delay: Duration::ZERO,
        }
    }

    /// Block for `delay` on every fetch, like a slow serial device
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }
}

impl HardwareDevice for SimulatedFocusMotor {
    fn name(&self) -> &str {
        "focus"
    }

    fn buffer_columns(&self) -> usize {
        3
    }

    fn accepted_commands(&self) -> Vec<(CommandKind, &'static str)> {
        vec![(CommandKind::MoveFocus, "move_focus")]
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn fetch(&mut self, now: f64, out: &mut DeviceOutput) -> Result<()> {
        if !self.connected {
            return Err(ManagerError::Device("focus motor is not connected".to_string()));
        }
        if !self.fetch_delay.is_zero() {
            std::thread::sleep(self.fetch_delay);
        }
        let dt = self.last_fetch.map_or(0.0, |last| (now - last).max(0.0));
        self.last_fetch = Some(now);

        let remaining = self.target - self.position;
        let step = (self.speed * dt).min(remaining.abs()).copysign(remaining);
        self.position += step;
        out.push_row(vec![now, self.position, self.target]);

        if self.moving && (self.target - self.position).abs() < f64::EPSILON {
            self.position = self.target;
            self.moving = false;
            out.notify(Command::FocusMoveCompleted);
        }
        Ok(())
    }

    fn handle(&mut self, command: Command, _now: f64, _out: &mut DeviceOutput) -> Result<()> {
        match command {
            Command::MoveFocus { dz } => {
                self.target += dz;
                self.moving = true;
                Ok(())
            }
            other => Err(ManagerError::Handler {
                command: other.kind(),
                reason: "focus motor only accepts MoveFocus".to_string(),
            }),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerStatus;
    use crate::test_support::{harness_with, small_config};
    use scopelink_ipc::CommandRegistry;
    use tempfile::tempdir;

    #[test]
    fn test_focus_motor_slews_and_reports_arrival() {
        let mut motor = SimulatedFocusMotor::new(100.0);
        motor.connect().unwrap();
        let mut out = DeviceOutput::default();
        motor.fetch(0.0, &mut out).unwrap();
        motor.handle(Command::MoveFocus { dz: 150.0 }, 0.0, &mut out).unwrap();

        let mut out = DeviceOutput::default();
        motor.fetch(1.0, &mut out).unwrap();
        assert_eq!(motor.position(), 100.0);
        assert!(out.notifications.is_empty());

        let mut out = DeviceOutput::default();
        motor.fetch(2.0, &mut out).unwrap();
        assert_eq!(motor.position(), 150.0);
        assert_eq!(out.notifications, vec![Command::FocusMoveCompleted]);
        assert_eq!(out.rows, vec![vec![2.0, 150.0, 150.0]]);
        assert!(!motor.is_moving());

        assert!(motor
            .handle(Command::FocusMoveCompleted, 2.0, &mut DeviceOutput::default())
            .is_err());
    }

    #[test]
    fn test_manager_registers_and_buffers_telemetry() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path());
        let template = HardwareManager::new(SimulatedFocusMotor::default());
        assert_eq!(template.role(), Role::Hardware("focus".into()));
        assert_eq!(
            template.handlers().registrations(),
            vec![(CommandKind::MoveFocus, "move_focus")]
        );

        let mut registry = CommandRegistry::new();
        registry
            .register_all(&template.role(), template.handlers().registrations())
            .unwrap();
        registry
            .register(Role::LockController, CommandKind::FocusMoveCompleted, "focus_move_completed")
            .unwrap();
        let requests = template.buffer_requests();
        let (resources, router_end, _buffers) =
            harness_with(template.role(), &config, registry, &requests);

        let mut ctx = ManagerContext::new(resources, ManagerStatus::new());
        let mut manager = HardwareManager::new(SimulatedFocusMotor::new(1e12));
        manager.setup(&mut ctx).unwrap();
        manager.do_main_loop(&mut ctx).unwrap();
        manager
            .on_device_command(&mut ctx, Command::MoveFocus { dz: 40.0 })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        manager.do_main_loop(&mut ctx).unwrap();

        assert_eq!(manager.device().position(), 40.0);
        assert_eq!(
            router_end.try_recv().unwrap().unwrap().payload,
            Command::FocusMoveCompleted
        );
        let telemetry = ctx.attach_extra("focus").unwrap().latest_rows(10);
        assert_eq!(telemetry.nrows(), 2);
        assert_eq!(telemetry[[1, 1]], 40.0);

        manager.teardown(&mut ctx).unwrap();
        manager.do_main_loop(&mut ctx).unwrap();
        assert_eq!(ctx.attach_extra("focus").unwrap().latest_rows(10).nrows(), 2);
    }
}
