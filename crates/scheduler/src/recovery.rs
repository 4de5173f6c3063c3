// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};

use std::sync::Arc;

use chrono::Utc;
use dal::{StorageError, StorageResult, ID};
use models::{Driver, Task, TaskInput, TaskOutput, TaskState};
use storage::{heartbeat::liveness_threshold, DataStorage, MetadataStorage, Storage};

/// Re-plans a job that is in a mixed state after failures.
///
/// `compute` partitions the job's {Failed, Running-on-a-dead-worker} tasks
/// into those that can run immediately and those still waiting on upstream
/// work, writing the Ready/Pending states back. When a task's input chain
/// passes through a non-persisted data blob that has been garbage collected,
/// the upstream task that produced it is marked Failed and re-planned too,
/// transitively. Nothing is dispatched from here.
pub struct JobRecovery {
    job_id: ID,
    store: Arc<dyn Storage>,

    ready_tasks: Vec<ID>,
    pending_tasks: Vec<ID>,
}

impl JobRecovery {
    pub fn new(job_id: ID, store: Arc<dyn Storage>) -> Self {
        Self {
            job_id,
            store,
            ready_tasks: Vec::new(),
            pending_tasks: Vec::new(),
        }
    }

    pub fn ready_tasks(&self) -> &[ID] {
        &self.ready_tasks
    }

    pub fn pending_tasks(&self) -> &[ID] {
        &self.pending_tasks
    }

    pub async fn compute(&mut self) -> StorageResult<()> {
        self.ready_tasks.clear();
        self.pending_tasks.clear();

        let tasks = self.store.get_job_tasks(self.job_id).await?;
        let by_id: HashMap<ID, Task> = tasks.iter().map(|t| (t.id, t.clone())).collect();

        let drivers: HashMap<ID, Driver> = self
            .store
            .get_drivers()
            .await?
            .into_iter()
            .map(|d| (d.id.into_id(), d))
            .collect();
        let threshold = liveness_threshold();
        let now = Utc::now();

        // Seed: failed tasks plus running tasks whose worker is gone.
        let mut targets: HashSet<ID> = HashSet::new();
        for task in &tasks {
            match task.state {
                TaskState::Failed => {
                    targets.insert(task.id);
                }
                TaskState::Running => {
                    let orphaned = match self.store.get_task_instance(task.id).await? {
                        None => true,
                        Some(instance) => match drivers.get(&instance.worker) {
                            None => true,
                            Some(worker) => worker.is_dead(now, threshold),
                        },
                    };
                    if orphaned {
                        targets.insert(task.id);
                    }
                }
                _ => {}
            }
        }

        // Transitive closure: an upstream whose produced data has been
        // collected must rerun before its consumers can.
        loop {
            let mut grew = false;
            for task in &tasks {
                if !targets.contains(&task.id) {
                    continue;
                }
                for input in &task.inputs {
                    let TaskInput::OutputRef { task: up, index, .. } = input else {
                        continue;
                    };
                    let Some(upstream) = by_id.get(up) else {
                        continue;
                    };
                    if upstream.state != TaskState::Succeeded || targets.contains(up) {
                        continue;
                    }
                    if let Some(TaskOutput::Data { id }) = upstream.outputs.get(*index) {
                        if !self.data_exists(*id).await? {
                            tracing::info!(
                                "upstream task {up} must rerun: its output data {id} is gone"
                            );
                            targets.insert(*up);
                            grew = true;
                        }
                    }
                }
            }
            if !grew {
                break;
            }
        }

        // Partition each target by whether its inputs are available now.
        for task in &tasks {
            if !targets.contains(&task.id) {
                continue;
            }

            let mut resolved = true;
            let mut unrecoverable = false;
            for input in &task.inputs {
                match input {
                    TaskInput::Value { .. } => {}
                    TaskInput::DataRef { id } => {
                        if !self.data_exists(*id).await? {
                            unrecoverable = true;
                        }
                    }
                    TaskInput::OutputRef { task: up, index, .. } => {
                        let available = by_id
                            .get(up)
                            .map(|upstream| {
                                upstream.state == TaskState::Succeeded
                                    && !targets.contains(up)
                                    && upstream
                                        .outputs
                                        .get(*index)
                                        .map(TaskOutput::is_written)
                                        .unwrap_or(false)
                            })
                            .unwrap_or(false);
                        if !available {
                            resolved = false;
                        }
                    }
                }
            }

            if unrecoverable {
                // A driver-owned input blob is gone for good; no amount of
                // re-running upstream tasks brings it back.
                tracing::warn!("task {} lost an input blob and cannot recover", task.id);
                self.store
                    .set_task_state(task.id, TaskState::Failed)
                    .await?;
                continue;
            }

            if resolved {
                self.store.set_task_state(task.id, TaskState::Ready).await?;
                self.ready_tasks.push(task.id);
            } else {
                self.store
                    .set_task_state(task.id, TaskState::Pending)
                    .await?;
                self.pending_tasks.push(task.id);
            }
        }

        Ok(())
    }

    async fn data_exists(&self, id: ID) -> StorageResult<bool> {
        match self.store.get_data(id).await {
            Ok(_) => Ok(true),
            Err(StorageError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
