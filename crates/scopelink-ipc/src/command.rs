// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Command model
//!
//! [`Command`] is the closed set of payloads managers exchange. Each variant
//! has a [`CommandKind`] discriminant whose [`DeliveryMode`] is fixed here;
//! which role a direct command reaches is decided by the registry at startup.

use scopelink_config::ScopeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::role::Role;

/// How a command kind is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Exactly one role handles it
    Direct,
    /// Every live manager receives it
    Broadcast,
    /// Executed by the router host itself
    Local,
}

/// What a manager is currently recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionMode {
    #[default]
    Track,
    TrackAndCropVideo,
    TrackAndFullVideo,
    CropVideo,
    FullVideo,
    Zlut,
}

/// Bead region of interest in pixels, `[x0, x1) × [y0, y1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadRoi {
    pub x0: u32,
    pub x1: u32,
    pub y0: u32,
    pub y1: u32,
}

impl BeadRoi {
    pub fn new(x0: u32, x1: u32, y0: u32, y1: u32) -> Self {
        Self { x0, x1, y0, y1 }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x0 as f64 + self.x1 as f64) / 2.0,
            (self.y0 as f64 + self.y1 as f64) / 2.0,
        )
    }
}

/// One bead correction in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeadMove {
    pub bead_id: u32,
    pub dx: f64,
    pub dy: f64,
}

/// Script manager state, mirrored to presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScriptStatus {
    #[default]
    Empty,
    Loaded,
    Running,
    Paused,
    Finished,
    Error,
}

/// One script step; `wait` holds the script until `UpdateWaiting` arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub command: Command,
    #[serde(default)]
    pub wait: bool,
}

impl ScriptStep {
    pub fn new(command: Command) -> Self {
        Self { command, wait: false }
    }

    pub fn waiting(command: Command) -> Self {
        Self { command, wait: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // Lifecycle and shared acquisition state (broadcast)
    Quit,
    SetAcquisitionOn { value: bool },
    SetAcquisitionDir { value: Option<String> },
    SetAcquisitionDirOn { value: bool },
    SetAcquisitionMode { mode: AcquisitionMode },
    SetBeadRois { rois: BTreeMap<u32, BeadRoi> },
    SetConfig { config: Box<ScopeConfig> },

    // Diagnostics
    LogException { role: Role, details: String },
    TaskFailed { task: String, details: String },
    ShutdownTimedOut { roles: Vec<Role> },
    VideoBufferPurged { at: f64 },
    ShowMessage { text: String, details: Option<String> },
    ShowError { text: String, details: Option<String> },

    // Bead and focus corrections
    MoveBeads { moves: Vec<BeadMove> },
    RemoveBeadsFromPendingMoves { ids: Vec<u32> },
    MoveFocus { dz: f64 },
    FocusMoveCompleted,
    ExecuteXyLock { now: Option<f64> },

    // Lock controller tunables
    SetXyLockOn { value: bool },
    SetXyLockInterval { value: f64 },
    SetXyLockMax { value: f64 },
    SetXyLockWindow { value: u32 },
    SetZLockOn { value: bool },
    SetZLockBead { value: u32 },
    SetZLockTarget { value: f64 },
    SetZLockInterval { value: f64 },
    SetZLockMax { value: f64 },

    // Camera
    SetCameraSetting { name: String, value: String },
    GetCameraSetting { name: String },
    CameraSettingChanged { name: String, value: String },

    // Scripting
    LoadScript { steps: Vec<ScriptStep> },
    StartScript,
    PauseScript,
    ResumeScript,
    UpdateScriptStatus { status: ScriptStatus },
    UpdateScriptProgress { current_step: u32, total_steps: u32, description: Option<String> },
    UpdateWaiting,
    Sleep { seconds: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    Quit,
    SetAcquisitionOn,
    SetAcquisitionDir,
    SetAcquisitionDirOn,
    SetAcquisitionMode,
    SetBeadRois,
    SetConfig,
    LogException,
    TaskFailed,
    ShutdownTimedOut,
    VideoBufferPurged,
    ShowMessage,
    ShowError,
    MoveBeads,
    RemoveBeadsFromPendingMoves,
    MoveFocus,
    FocusMoveCompleted,
    ExecuteXyLock,
    SetXyLockOn,
    SetXyLockInterval,
    SetXyLockMax,
    SetXyLockWindow,
    SetZLockOn,
    SetZLockBead,
    SetZLockTarget,
    SetZLockInterval,
    SetZLockMax,
    SetCameraSetting,
    GetCameraSetting,
    CameraSettingChanged,
    LoadScript,
    StartScript,
    PauseScript,
    ResumeScript,
    UpdateScriptStatus,
    UpdateScriptProgress,
    UpdateWaiting,
    Sleep,
}

impl CommandKind {
    /// Kinds every manager handles inside its runner
    pub const BROADCAST: [CommandKind; 7] = [
        CommandKind::Quit,
        CommandKind::SetAcquisitionOn,
        CommandKind::SetAcquisitionDir,
        CommandKind::SetAcquisitionDirOn,
        CommandKind::SetAcquisitionMode,
        CommandKind::SetBeadRois,
        CommandKind::SetConfig,
    ];

    /// Kinds the router host executes
    pub const LOCAL: [CommandKind; 2] = [CommandKind::LogException, CommandKind::TaskFailed];

    /// Reports and acknowledgements; they ask nobody for new work
    pub const NOTIFICATIONS: [CommandKind; 10] = [
        CommandKind::ShutdownTimedOut,
        CommandKind::VideoBufferPurged,
        CommandKind::ShowMessage,
        CommandKind::ShowError,
        CommandKind::CameraSettingChanged,
        CommandKind::UpdateScriptStatus,
        CommandKind::UpdateScriptProgress,
        CommandKind::UpdateWaiting,
        CommandKind::FocusMoveCompleted,
        CommandKind::RemoveBeadsFromPendingMoves,
    ];

    pub fn delivery_mode(self) -> DeliveryMode {
        if Self::BROADCAST.contains(&self) {
            DeliveryMode::Broadcast
        } else if Self::LOCAL.contains(&self) {
            DeliveryMode::Local
        } else {
            DeliveryMode::Direct
        }
    }

    pub fn is_notification(self) -> bool {
        Self::NOTIFICATIONS.contains(&self)
    }

    /// Whether a script step may carry this kind
    pub fn script_eligible(self) -> bool {
        use CommandKind::*;
        matches!(
            self,
            SetAcquisitionOn
                | SetAcquisitionDir
                | SetAcquisitionDirOn
                | SetAcquisitionMode
                | ShowMessage
                | MoveFocus
                | ExecuteXyLock
                | SetXyLockOn
                | SetXyLockInterval
                | SetXyLockMax
                | SetXyLockWindow
                | SetZLockOn
                | SetZLockBead
                | SetZLockTarget
                | SetZLockInterval
                | SetZLockMax
                | SetCameraSetting
                | Sleep
        )
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Quit => CommandKind::Quit,
            Command::SetAcquisitionOn { .. } => CommandKind::SetAcquisitionOn,
            Command::SetAcquisitionDir { .. } => CommandKind::SetAcquisitionDir,
            Command::SetAcquisitionDirOn { .. } => CommandKind::SetAcquisitionDirOn,
            Command::SetAcquisitionMode { .. } => CommandKind::SetAcquisitionMode,
            Command::SetBeadRois { .. } => CommandKind::SetBeadRois,
            Command::SetConfig { .. } => CommandKind::SetConfig,
            Command::LogException { .. } => CommandKind::LogException,
            Command::TaskFailed { .. } => CommandKind::TaskFailed,
            Command::ShutdownTimedOut { .. } => CommandKind::ShutdownTimedOut,
            Command::VideoBufferPurged { .. } => CommandKind::VideoBufferPurged,
            Command::ShowMessage { .. } => CommandKind::ShowMessage,
            Command::ShowError { .. } => CommandKind::ShowError,
            Command::MoveBeads { .. } => CommandKind::MoveBeads,
            Command::RemoveBeadsFromPendingMoves { .. } => CommandKind::RemoveBeadsFromPendingMoves,
            Command::MoveFocus { .. } => CommandKind::MoveFocus,
            Command::FocusMoveCompleted => CommandKind::FocusMoveCompleted,
            Command::ExecuteXyLock { .. } => CommandKind::ExecuteXyLock,
            Command::SetXyLockOn { .. } => CommandKind::SetXyLockOn,
            Command::SetXyLockInterval { .. } => CommandKind::SetXyLockInterval,
            Command::SetXyLockMax { .. } => CommandKind::SetXyLockMax,
            Command::SetXyLockWindow { .. } => CommandKind::SetXyLockWindow,
            Command::SetZLockOn { .. } => CommandKind::SetZLockOn,
            Command::SetZLockBead { .. } => CommandKind::SetZLockBead,
            Command::SetZLockTarget { .. } => CommandKind::SetZLockTarget,
            Command::SetZLockInterval { .. } => CommandKind::SetZLockInterval,
            Command::SetZLockMax { .. } => CommandKind::SetZLockMax,
            Command::SetCameraSetting { .. } => CommandKind::SetCameraSetting,
            Command::GetCameraSetting { .. } => CommandKind::GetCameraSetting,
            Command::CameraSettingChanged { .. } => CommandKind::CameraSettingChanged,
            Command::LoadScript { .. } => CommandKind::LoadScript,
            Command::StartScript => CommandKind::StartScript,
            Command::PauseScript => CommandKind::PauseScript,
            Command::ResumeScript => CommandKind::ResumeScript,
            Command::UpdateScriptStatus { .. } => CommandKind::UpdateScriptStatus,
            Command::UpdateScriptProgress { .. } => CommandKind::UpdateScriptProgress,
            Command::UpdateWaiting => CommandKind::UpdateWaiting,
            Command::Sleep { .. } => CommandKind::Sleep,
        }
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.kind().delivery_mode()
    }

    /// Short human-readable description shown while a script runs
    pub fn describe(&self) -> String {
        match self {
            Command::SetAcquisitionOn { value: true } => "Start acquisition".to_string(),
            Command::SetAcquisitionOn { value: false } => "Stop acquisition".to_string(),
            Command::SetAcquisitionDirOn { value } => {
                if *value {
                    "Enable acquisition directory".to_string()
                } else {
                    "Disable acquisition directory".to_string()
                }
            }
            Command::SetAcquisitionDir { value: None } => "Clear acquisition directory".to_string(),
            Command::SetAcquisitionDir { value: Some(dir) } => format!("Set acquisition directory to {}", dir),
            Command::SetAcquisitionMode { mode } => format!("Set acquisition mode to {:?}", mode),
            Command::ShowMessage { text, .. } => text.clone(),
            Command::ExecuteXyLock { .. } => "Execute XY lock adjustment".to_string(),
            Command::SetXyLockOn { value } => format!("{} XY lock", if *value { "Enable" } else { "Disable" }),
            Command::SetXyLockInterval { value } => format!("Set XY lock interval to {} seconds", value),
            Command::SetXyLockMax { value } => format!("Set XY lock max displacement to {}", value),
            Command::SetXyLockWindow { value } => format!("Set XY lock window to {}", value),
            Command::SetZLockOn { value } => format!("{} Z lock", if *value { "Enable" } else { "Disable" }),
            Command::SetZLockBead { value } => format!("Set Z lock bead to {}", value),
            Command::SetZLockTarget { value } => format!("Set Z lock target to {}", value),
            Command::SetZLockInterval { value } => format!("Set Z lock interval to {} seconds", value),
            Command::SetZLockMax { value } => format!("Set Z lock max displacement to {}", value),
            Command::Sleep { seconds } => format!("Wait for {} seconds", seconds),
            other => format!("{:?}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_modes() {
        assert_eq!(CommandKind::Quit.delivery_mode(), DeliveryMode::Broadcast);
        assert_eq!(CommandKind::SetConfig.delivery_mode(), DeliveryMode::Broadcast);
        assert_eq!(CommandKind::TaskFailed.delivery_mode(), DeliveryMode::Local);
        assert_eq!(CommandKind::MoveFocus.delivery_mode(), DeliveryMode::Direct);
    }

    #[test]
    fn test_notifications_are_direct_and_carry_no_work() {
        for kind in CommandKind::NOTIFICATIONS {
            assert_eq!(kind.delivery_mode(), DeliveryMode::Direct, "{:?}", kind);
        }
        assert!(CommandKind::VideoBufferPurged.is_notification());
        assert!(CommandKind::ShowError.is_notification());
        assert!(!CommandKind::MoveBeads.is_notification());
        assert!(!CommandKind::MoveFocus.is_notification());
        assert!(!CommandKind::Quit.is_notification());
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Command::MoveFocus { dz: 1.0 }.kind(), CommandKind::MoveFocus);
        assert_eq!(Command::FocusMoveCompleted.kind(), CommandKind::FocusMoveCompleted);
        assert_eq!(
            Command::UpdateScriptProgress { current_step: 1, total_steps: 2, description: None }.kind(),
            CommandKind::UpdateScriptProgress
        );
    }

    #[test]
    fn test_script_steps_deserialize_from_json() {
        let json = r#"[
            {"command": {"SetAcquisitionOn": {"value": true}}},
            {"command": {"Sleep": {"seconds": 0.5}}, "wait": true},
            {"command": "FocusMoveCompleted"}
        ]"#;
        let steps: Vec<ScriptStep> = serde_json::from_str(json).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(!steps[0].wait);
        assert!(steps[1].wait);
        assert_eq!(steps[1].command.describe(), "Wait for 0.5 seconds");
        assert_eq!(steps[2].command, Command::FocusMoveCompleted);
    }

    #[test]
    fn test_roi_center() {
        assert_eq!(BeadRoi::new(0, 26, 10, 36).center(), (13.0, 23.0));
    }
}
