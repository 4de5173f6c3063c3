// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! The storage facade every component coordinates through: metadata
//! operations (drivers, jobs, tasks, instances) and data-blob operations.
//!
//! Two backends implement the capability: [`mem::MemoryStorage`], the
//! reference used by the test suite, and [`pg::PgStorage`], backed by
//! postgres through the `dal` machinery. Every trait operation is internally
//! atomic (one lock scope in memory, one transaction in postgres) and
//! guarded transitions surface races as
//! [`StorageError::PreconditionFailed`], so two schedulers contending for
//! one Ready task produce exactly one Running transition.

pub mod heartbeat;
pub mod mem;
pub mod pg;
pub mod reaper;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use dal::{StorageError, StorageResult, ID};
use models::{Data, Driver, Job, JobStatus, Task, TaskGraph, TaskInstance, TaskOutput, TaskState};

#[async_trait]
pub trait MetadataStorage: Send + Sync {
    /// Upserts the driver row; re-registration after a restart is normal.
    async fn add_driver(&self, driver: &Driver) -> StorageResult<()>;

    async fn remove_driver(&self, id: ID) -> StorageResult<()>;

    /// Writes `now()` into the driver's heartbeat column. Idempotent modulo
    /// the timestamp itself.
    async fn update_heartbeat(&self, id: ID) -> StorageResult<()>;

    async fn get_driver(&self, id: ID) -> StorageResult<Driver>;

    async fn get_drivers(&self) -> StorageResult<Vec<Driver>>;

    /// Atomic insertion of a job and all of its tasks. The graph is
    /// validated first; tasks with no task-output-edge inputs come out
    /// Ready, the rest Pending.
    async fn add_job(&self, job_id: ID, client_id: ID, graph: &TaskGraph) -> StorageResult<()>;

    /// Cascade removal: tasks, task instances, and task-produced data rows
    /// go with the job.
    async fn remove_job(&self, job_id: ID) -> StorageResult<()>;

    async fn get_job(&self, job_id: ID) -> StorageResult<Job>;

    async fn get_jobs_for_client(&self, client_id: ID) -> StorageResult<Vec<Job>>;

    /// Derived from task states: Failed/Cancelled dominate, then Succeeded
    /// once every output task has succeeded, otherwise Running.
    async fn get_job_status(&self, job_id: ID) -> StorageResult<JobStatus>;

    async fn get_job_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>>;

    /// The job's tasks that no other task of the job consumes.
    async fn get_job_output_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>>;

    async fn get_task(&self, task_id: ID) -> StorageResult<Task>;

    async fn set_task_state(&self, task_id: ID, state: TaskState) -> StorageResult<()>;

    /// Ready tasks joined to their jobs, ordered ascending by job creation
    /// time with the task id as a stable tiebreaker.
    async fn get_ready_tasks(&self) -> StorageResult<Vec<Task>>;

    /// Guarded Ready→Running transition plus insertion of the instance row.
    /// Loses of a dispatch race observe `PreconditionFailed`.
    async fn task_dispatch(&self, instance: &TaskInstance) -> StorageResult<()>;

    /// Guarded Running→Succeeded transition with atomic output visibility;
    /// rejects the commit when `instance` is not the task's live instance.
    /// Downstream tasks whose inputs all resolved flip to Ready in the same
    /// step.
    async fn task_finish(&self, instance: &TaskInstance, outputs: &[TaskOutput])
        -> StorageResult<()>;

    /// Failure commit: back to Ready while retries remain, terminal Failed
    /// otherwise. Same instance-match guard as `task_finish`.
    async fn task_fail(&self, instance: &TaskInstance, message: &str) -> StorageResult<()>;

    /// Fast-path reset used when a worker reports its own failed task while
    /// polling: Running→Ready iff the live instance belongs to that worker.
    /// Returns whether a reset happened.
    async fn reset_task_for_worker(&self, task_id: ID, worker_id: ID) -> StorageResult<bool>;

    /// Reclaims a task from a dead worker: drops the live instance, bumps
    /// the retry counter and puts the task back to Ready.
    async fn reclaim_task(&self, task_id: ID) -> StorageResult<()>;

    async fn cancel_task(&self, task_id: ID) -> StorageResult<()>;

    /// The live instance for a task, if one exists.
    async fn get_task_instance(&self, task_id: ID) -> StorageResult<Option<TaskInstance>>;

    async fn get_instances_for_worker(&self, worker_id: ID) -> StorageResult<Vec<TaskInstance>>;
}

#[async_trait]
pub trait DataStorage: Send + Sync {
    /// Creates a blob owned by a (client) driver.
    async fn add_driver_data(&self, driver_id: ID, data: &Data) -> StorageResult<()>;

    /// Creates a blob owned by the task that produced it.
    async fn add_task_data(&self, task_id: ID, data: &Data) -> StorageResult<()>;

    async fn get_data(&self, id: ID) -> StorageResult<Data>;

    /// Refuses while the blob is still referenced by a live input of a
    /// non-terminal task.
    async fn remove_data(&self, id: ID) -> StorageResult<()>;

    async fn set_data_locality(&self, id: ID, locality: &[String], hard: bool)
        -> StorageResult<()>;

    async fn set_data_persisted(&self, id: ID, persisted: bool) -> StorageResult<()>;

    async fn get_data_for_driver(&self, driver_id: ID) -> StorageResult<Vec<Data>>;
}

/// The full capability a component holds.
pub trait Storage: MetadataStorage + DataStorage {}
impl<T: MetadataStorage + DataStorage> Storage for T {}

/// Connects to the store named by `storage_url`.
///
/// `memory://` yields a fresh in-memory store (single-process only);
/// `postgres://…` connects through the postgres backend.
pub async fn connect(storage_url: &str) -> StorageResult<Arc<dyn Storage>> {
    let parsed = url::Url::parse(storage_url)
        .map_err(|e| StorageError::Connection(format!("bad storage url {storage_url}: {e}")))?;

    match parsed.scheme() {
        "memory" => Ok(Arc::new(mem::MemoryStorage::new())),
        "postgres" | "postgresql" => Ok(Arc::new(pg::PgStorage::connect(storage_url).await?)),
        other => Err(StorageError::Connection(format!(
            "unsupported storage scheme {other}"
        ))),
    }
}

/// Derives a job status from its tasks; shared by both backends.
pub(crate) fn derive_job_status(tasks: &[Task], output_tasks: &[&Task]) -> JobStatus {
    if tasks
        .iter()
        .any(|t| t.state == TaskState::Cancelled)
    {
        return JobStatus::Cancelled;
    }

    // A failed task only fails the job once it is out of retries and thus
    // parked in the terminal Failed state.
    if tasks.iter().any(|t| t.state == TaskState::Failed) {
        return JobStatus::Failed;
    }

    if !output_tasks.is_empty()
        && output_tasks
            .iter()
            .all(|t| t.state == TaskState::Succeeded)
    {
        return JobStatus::Succeeded;
    }

    JobStatus::Running
}
