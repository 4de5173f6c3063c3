// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use dal::{StorageError, StorageResult, ID};
use models::{Data, Task, TaskInput, TaskInstance};
use storage::{DataStorage, MetadataStorage, Storage};

/// FIFO-over-jobs dispatch with a two-pass locality rule.
///
/// Pass one hands out the earliest Ready task whose every data input is
/// either unconstrained or resident at the requesting worker. Only when
/// nothing is local does pass two relax to soft-locality tasks; data marked
/// `hard_locality` never leaves its host list. Job-creation-time ordering
/// keeps fresh jobs from starving old ones.
pub struct FifoPolicy {
    scheduler_id: ID,
    store: Arc<dyn Storage>,
}

impl FifoPolicy {
    pub fn new(scheduler_id: ID, store: Arc<dyn Storage>) -> Self {
        Self {
            scheduler_id,
            store,
        }
    }

    pub fn scheduler_id(&self) -> ID {
        self.scheduler_id
    }

    /// Selects and dispatches the next task for `worker_id` at
    /// `worker_addr`, returning `(task_id, instance_id)`.
    ///
    /// A reported `last_failed` task is reset Running→Ready first (iff it
    /// still belongs to that worker), so a crashed execution can restart
    /// without waiting for a heartbeat timeout.
    pub async fn schedule_next(
        &self,
        worker_id: ID,
        worker_addr: &str,
        last_failed: Option<ID>,
    ) -> StorageResult<Option<(ID, ID)>> {
        if let Some(failed) = last_failed {
            match self.store.reset_task_for_worker(failed, worker_id).await {
                Ok(true) => {
                    tracing::info!("reset failed task {failed} reported by worker {worker_id}")
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("could not reset failed task {failed}: {e}"),
            }
        }

        loop {
            let ready = self.store.get_ready_tasks().await?;

            let Some(task_id) = self.pick(&ready, worker_addr).await? else {
                return Ok(None);
            };

            let instance = TaskInstance::new(task_id, worker_id);
            match self.store.task_dispatch(&instance).await {
                Ok(()) => {
                    tracing::debug!(
                        "scheduler {} dispatched task {task_id} to worker {worker_id}",
                        self.scheduler_id
                    );
                    return Ok(Some((task_id, instance.id)));
                }
                // Another scheduler won this task; select again.
                Err(StorageError::PreconditionFailed(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn pick(&self, ready: &[Task], worker_addr: &str) -> StorageResult<Option<ID>> {
        let mut candidates: Vec<(ID, Vec<Data>)> = Vec::with_capacity(ready.len());
        for task in ready {
            match self.data_inputs(task).await {
                Ok(data) => candidates.push((task.id, data)),
                Err(StorageError::KeyNotFound(msg)) => {
                    // A referenced blob is gone; recovery owns that task.
                    tracing::debug!("skipping task {}: {msg}", task.id);
                }
                Err(e) => return Err(e),
            }
        }

        // Pass one: best-effort local.
        for (task_id, data) in &candidates {
            if data.iter().all(|d| d.locality_allows(worker_addr)) {
                return Ok(Some(*task_id));
            }
        }

        // Pass two: anything whose constraints are merely advisory.
        for (task_id, data) in &candidates {
            if data
                .iter()
                .all(|d| !d.hard_locality || d.locality_allows(worker_addr))
            {
                return Ok(Some(*task_id));
            }
        }

        Ok(None)
    }

    async fn data_inputs(&self, task: &Task) -> StorageResult<Vec<Data>> {
        let mut data = Vec::new();
        for input in &task.inputs {
            if let TaskInput::DataRef { id } = input {
                data.push(self.store.get_data(*id).await?);
            }
        }
        Ok(data)
    }
}
