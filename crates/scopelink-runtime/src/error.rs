// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime error types

use scopelink_buffers::{BufferError, PoolFlagError};
use scopelink_ipc::{CommandKind, IpcError, Role};
use thiserror::Error;

/// Errors raised inside a manager's loop, handlers or pool tasks
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Task '{task}' failed: {details}")]
    WorkerTaskFailure { task: String, details: String },

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Pool flag error: {0}")]
    PoolFlag(#[from] PoolFlagError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Handler for {command:?} failed: {reason}")]
    Handler { command: CommandKind, reason: String },

    #[error("Panic in {context}: {message}")]
    Panicked { context: String, message: String },

    #[error("Shared resources not configured: {0}")]
    MissingResource(String),

    #[error("Invalid buffer request: {0}")]
    InvalidRequest(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Worker pool is stopped")]
    PoolStopped,

    #[error("Failed to spawn {0}")]
    Spawn(String),

    #[error("Manager process error: {0}")]
    Process(String),
}

/// Result type for manager operations
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Orchestrator startup, supervision and shutdown errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Role {0} already has a manager")]
    DuplicateRole(Role),

    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("Orchestrator has already run; create a new instance")]
    AlreadyTerminated,

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error("Managers did not stop in time: {roles:?}")]
    ShutdownTimeout { roles: Vec<Role> },

    #[error("Registry error: {0}")]
    Registry(#[from] IpcError),

    #[error("Buffer allocation failed: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to start {role}: {reason}")]
    Spawn { role: String, reason: String },
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
