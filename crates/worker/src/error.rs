// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use dal::StorageError;

/// Failures of the framed worker↔executor pipe.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the pipe; for the parent this means the child died.
    #[error("pipe closed unexpectedly")]
    PipeEof,

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("pipe i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while setting up, running, or committing one task execution.
#[derive(Debug, thiserror::Error)]
pub enum TaskExecutionError {
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("output unavailable: {0}")]
    OutputUnavailable(String),

    #[error("invalid output: {0}")]
    OutputInvalid(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures building the registered-task table at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no task library named {0} is linked into this binary")]
    UnknownLibrary(String),

    #[error("task function {0} is registered twice")]
    DuplicateFunction(String),
}

/// Worker daemon failures, mapped onto process exit codes by `main`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("bad command line: {0}")]
    CmdLineInvalid(String),

    #[error("failed to install signal handler: {0}")]
    SignalInstallFailed(String),

    #[error("cannot connect to storage: {0}")]
    StorageConnect(StorageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("task processing failed: {0}")]
    Task(String),
}

impl From<RegistryError> for WorkerError {
    fn from(e: RegistryError) -> Self {
        WorkerError::CmdLineInvalid(e.to_string())
    }
}
