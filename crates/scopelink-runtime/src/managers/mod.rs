// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Built-in managers, one per fixed role, plus the generic hardware host

pub mod camera;
pub mod hardware;
pub mod lock_controller;
pub mod pool;
pub mod scripting;

pub use camera::{Camera, CameraManager, CapturedStack, SimulatedCamera};
pub use hardware::{DeviceOutput, HardwareDevice, HardwareManager, SimulatedFocusMotor};
pub use lock_controller::{axis_correction, xy_correction, LockController};
pub use pool::{StaticRoiProcessor, Stack, StackProcessor, StackTask, WorkerPoolManager};
pub use scripting::{load_script_file, load_script_json, ScriptManager};
