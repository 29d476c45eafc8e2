// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Managers hosted in `scopelink-manager` processes next to the
//! orchestrator, which talks to them over the process link.

use scopelink_config::ScopeConfig;
use scopelink_ipc::{Command, CommandKind, Role};
use scopelink_runtime::{ManagerState, Orchestrator, ProcessSpec};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn process_config(dir: &Path) -> ScopeConfig {
    let mut config = ScopeConfig::default();
    config.buffers.segment_dir = dir.to_path_buf();
    config.buffers.video_stacks = 4;
    config.buffers.video_stack_depth = 2;
    config.buffers.tracks_rows = 16;
    config.camera.width = 8;
    config.camera.height = 8;
    config.camera.bits = 16;
    config.pool.workers = 1;
    config.processes.handshake_timeout_ms = 10_000;
    config
}

fn manager_process(role: Role, logs: &Path) -> ProcessSpec {
    ProcessSpec::new(role, env!("CARGO_BIN_EXE_scopelink-manager"))
        .arg("--log-dir")
        .arg(logs.display().to_string())
}

#[test]
fn test_camera_process_answers_and_stops_cleanly() {
    let segments = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let mut orchestrator = Orchestrator::new(process_config(segments.path())).unwrap();
    assert!(orchestrator
        .add_process(manager_process(Role::Camera, logs.path()))
        .unwrap());
    orchestrator
        .enable_presentation(&[CommandKind::CameraSettingChanged, CommandKind::ShowError])
        .unwrap();
    assert!(orchestrator
        .registry()
        .is_none());
    orchestrator.start().unwrap();
    let gui = orchestrator.take_presentation().unwrap();
    assert!(orchestrator
        .registry()
        .unwrap()
        .is_registered(CommandKind::SetCameraSetting));

    gui.send(Command::SetCameraSetting {
        name: "gain".to_string(),
        value: "3".to_string(),
    })
    .unwrap();
    let deadline = Instant::now() + WAIT;
    let mut changed = false;
    while !changed && Instant::now() < deadline {
        if let Some(envelope) = gui.recv_timeout(Duration::from_millis(20)).unwrap() {
            changed = envelope.payload
                == Command::CameraSettingChanged {
                    name: "gain".to_string(),
                    value: "3".to_string(),
                };
        }
    }
    assert!(changed, "camera process never reported the new gain");
    assert_eq!(orchestrator.manager_state(&Role::Camera), Some(ManagerState::Running));

    let report = orchestrator.stop().unwrap();
    assert!(report.is_clean());
    assert!(report.killed.is_empty());
    assert_eq!(orchestrator.manager_state(&Role::Camera), Some(ManagerState::Stopped));
    assert!(std::fs::read_dir(segments.path()).unwrap().next().is_none());
}

#[test]
fn test_late_process_is_reported_and_killed() {
    let segments = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let mut config = process_config(segments.path());
    config.shutdown.timeout_ms = 200;
    config.processes.kill_timeout_ms = 5_000;
    let mut orchestrator = Orchestrator::new(config).unwrap();
    let focus = Role::Hardware("focus".to_string());
    let spec = manager_process(focus.clone(), logs.path())
        .arg("--fetch-delay-ms")
        .arg("30000");
    assert!(orchestrator.add_process(spec).unwrap());
    orchestrator.start().unwrap();
    let deadline = Instant::now() + WAIT;
    while orchestrator.manager_state(&focus) != Some(ManagerState::Running) {
        assert!(Instant::now() < deadline, "focus process never started running");
        std::thread::sleep(Duration::from_millis(10));
    }

    let report = orchestrator.stop().unwrap();
    assert_eq!(report.late, vec![focus.clone()]);
    assert_eq!(report.killed, vec![focus.clone()]);
    assert!(report.ensure_clean().is_err());
    assert!(report.elapsed < Duration::from_secs(10));
    assert_eq!(orchestrator.manager_state(&focus), Some(ManagerState::Stopped));
}

#[test]
fn test_disabled_role_spawns_nothing() {
    let segments = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let mut config = process_config(segments.path());
    config.roles.camera = false;
    let mut orchestrator = Orchestrator::new(config).unwrap();
    assert!(!orchestrator
        .add_process(manager_process(Role::Camera, logs.path()))
        .unwrap());
    assert!(orchestrator.roles().is_empty());
}

#[test]
fn test_process_for_unknown_role_fails_to_start() {
    let segments = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let mut config = process_config(segments.path());
    config.processes.handshake_timeout_ms = 2_000;
    let mut orchestrator = Orchestrator::new(config).unwrap();
    let result = orchestrator.add_process(manager_process(Role::Hardware("stage".to_string()), logs.path()));
    assert!(matches!(
        result,
        Err(scopelink_runtime::OrchestratorError::Spawn { .. })
    ));
    assert!(orchestrator.roles().is_empty());
}
