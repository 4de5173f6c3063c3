// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Wire types of the scheduler↔worker request/reply channel.

use dal::ID;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetNextTaskRequest {
    pub worker_id: ID,
    pub worker_address: String,

    /// Set on the first poll after a local failure so the scheduler can
    /// reset the task without waiting for a heartbeat timeout.
    pub last_failed_task_id: Option<ID>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetNextTaskResponse {
    pub task: Option<TaskAssignment>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: ID,
    pub instance_id: ID,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatRequest {
    pub worker_id: ID,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CancelRequest {
    pub task_id: ID,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AckResponse {
    pub ok: bool,
}
