// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! In-memory reference implementation of the storage capability.
//!
//! One mutex guards the whole store, so each operation is trivially a
//! serializable transaction. This backend is what the test suite runs
//! against; it is also usable for single-process demos via `memory://`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dal::{StorageError, StorageResult, ID};
use models::{
    Data, DataOwner, Driver, Job, JobStatus, Task, TaskGraph, TaskInstance, TaskInput,
    TaskOutput, TaskState,
};
use parking_lot::Mutex;

use crate::{derive_job_status, DataStorage, MetadataStorage};

#[derive(Default)]
struct MemoryState {
    drivers: HashMap<ID, Driver>,
    jobs: HashMap<ID, Job>,
    tasks: HashMap<ID, Task>,
    instances: HashMap<ID, TaskInstance>,
    data: HashMap<ID, Data>,
}

impl MemoryState {
    fn task(&self, id: ID) -> StorageResult<&Task> {
        self.tasks
            .get(&id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no task {id}")))
    }

    fn task_mut(&mut self, id: ID) -> StorageResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no task {id}")))
    }

    fn live_instance(&self, task_id: ID) -> Option<&TaskInstance> {
        self.instances.values().find(|i| i.task == task_id)
    }

    /// Current resolution check for one input against stored task/output
    /// state.
    fn output_written(&self, task_id: ID, index: usize) -> bool {
        self.tasks
            .get(&task_id)
            .map(|t| {
                t.state == TaskState::Succeeded
                    && t.outputs.get(index).map(TaskOutput::is_written).unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Flips Pending tasks of `job_id` whose inputs all resolved to Ready.
    fn promote_ready(&mut self, job_id: ID) {
        let candidates: Vec<ID> = self
            .tasks
            .values()
            .filter(|t| {
                t.job.map(|j| j.into_id()) == Some(job_id) && t.state == TaskState::Pending
            })
            .map(|t| t.id)
            .collect();

        for id in candidates {
            let resolved = {
                let task = &self.tasks[&id];
                task.inputs
                    .iter()
                    .all(|input| match input {
                        TaskInput::Value { .. } | TaskInput::DataRef { .. } => true,
                        TaskInput::OutputRef { task, index, .. } => {
                            self.output_written(*task, *index)
                        }
                    })
            };
            if resolved {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.state = TaskState::Ready;
                }
            }
        }
    }

    /// Tasks of the job that no other task of the job consumes.
    fn output_task_ids(&self, job_id: ID) -> Vec<ID> {
        let job_tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.job.map(|j| j.into_id()) == Some(job_id))
            .collect();

        job_tasks
            .iter()
            .filter(|t| {
                !job_tasks.iter().any(|other| {
                    other.inputs.iter().any(
                        |i| matches!(i, TaskInput::OutputRef { task, .. } if *task == t.id),
                    )
                })
            })
            .map(|t| t.id)
            .collect()
    }
}

pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl MetadataStorage for MemoryStorage {
    async fn add_driver(&self, driver: &Driver) -> StorageResult<()> {
        let mut s = self.state.lock();
        s.drivers.insert(driver.id.into_id(), driver.clone());
        Ok(())
    }

    async fn remove_driver(&self, id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();
        s.drivers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StorageError::KeyNotFound(format!("no driver {id}")))
    }

    async fn update_heartbeat(&self, id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();
        let driver = s
            .drivers
            .get_mut(&id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no driver {id}")))?;
        driver.heartbeat = Utc::now();
        Ok(())
    }

    async fn get_driver(&self, id: ID) -> StorageResult<Driver> {
        let s = self.state.lock();
        s.drivers
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(format!("no driver {id}")))
    }

    async fn get_drivers(&self) -> StorageResult<Vec<Driver>> {
        Ok(self.state.lock().drivers.values().cloned().collect())
    }

    async fn add_job(&self, job_id: ID, client_id: ID, graph: &TaskGraph) -> StorageResult<()> {
        graph
            .validate()
            .map_err(|e| StorageError::ConstraintViolation(e.to_string()))?;

        let mut s = self.state.lock();
        if s.jobs.contains_key(&job_id) {
            return Err(StorageError::ConstraintViolation(format!(
                "job {job_id} already exists"
            )));
        }

        s.jobs.insert(job_id, Job::new(job_id, client_id));

        for task in graph.tasks() {
            let mut task = task.clone();
            task.job = Some(dal::FKey::from_id(job_id));
            task.state = if task
                .inputs
                .iter()
                .all(|i| !matches!(i, TaskInput::OutputRef { .. }))
            {
                TaskState::Ready
            } else {
                TaskState::Pending
            };
            s.tasks.insert(task.id, task);
        }

        Ok(())
    }

    async fn remove_job(&self, job_id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();
        s.jobs
            .remove(&job_id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no job {job_id}")))?;

        let task_ids: Vec<ID> = s
            .tasks
            .values()
            .filter(|t| t.job.map(|j| j.into_id()) == Some(job_id))
            .map(|t| t.id)
            .collect();

        for tid in &task_ids {
            s.tasks.remove(tid);
            let orphaned: Vec<ID> = s
                .instances
                .values()
                .filter(|i| i.task == *tid)
                .map(|i| i.id)
                .collect();
            for iid in orphaned {
                s.instances.remove(&iid);
            }
            let produced: Vec<ID> = s
                .data
                .values()
                .filter(|d| d.owner == DataOwner::Task(*tid))
                .map(|d| d.id)
                .collect();
            for did in produced {
                s.data.remove(&did);
            }
        }

        Ok(())
    }

    async fn get_job(&self, job_id: ID) -> StorageResult<Job> {
        let s = self.state.lock();
        s.jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(format!("no job {job_id}")))
    }

    async fn get_jobs_for_client(&self, client_id: ID) -> StorageResult<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.client == client_id)
            .cloned()
            .collect())
    }

    async fn get_job_status(&self, job_id: ID) -> StorageResult<JobStatus> {
        let s = self.state.lock();
        if !s.jobs.contains_key(&job_id) {
            return Err(StorageError::KeyNotFound(format!("no job {job_id}")));
        }

        let tasks: Vec<Task> = s
            .tasks
            .values()
            .filter(|t| t.job.map(|j| j.into_id()) == Some(job_id))
            .cloned()
            .collect();
        let output_ids = s.output_task_ids(job_id);
        let outputs: Vec<&Task> = tasks.iter().filter(|t| output_ids.contains(&t.id)).collect();

        Ok(derive_job_status(&tasks, &outputs))
    }

    async fn get_job_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>> {
        let s = self.state.lock();
        if !s.jobs.contains_key(&job_id) {
            return Err(StorageError::KeyNotFound(format!("no job {job_id}")));
        }
        Ok(s.tasks
            .values()
            .filter(|t| t.job.map(|j| j.into_id()) == Some(job_id))
            .cloned()
            .collect())
    }

    async fn get_job_output_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>> {
        let s = self.state.lock();
        if !s.jobs.contains_key(&job_id) {
            return Err(StorageError::KeyNotFound(format!("no job {job_id}")));
        }
        let ids = s.output_task_ids(job_id);
        Ok(ids.iter().filter_map(|id| s.tasks.get(id).cloned()).collect())
    }

    async fn get_task(&self, task_id: ID) -> StorageResult<Task> {
        let s = self.state.lock();
        s.task(task_id).cloned()
    }

    async fn set_task_state(&self, task_id: ID, state: TaskState) -> StorageResult<()> {
        let mut s = self.state.lock();
        s.task_mut(task_id)?.state = state;
        Ok(())
    }

    async fn get_ready_tasks(&self) -> StorageResult<Vec<Task>> {
        let s = self.state.lock();
        let mut ready: Vec<Task> = s
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .cloned()
            .collect();

        ready.sort_by_key(|t| {
            let created = t
                .job
                .and_then(|j| s.jobs.get(&j.into_id()))
                .map(|j| j.created_at)
                .unwrap_or_else(Utc::now);
            (created, t.id)
        });

        Ok(ready)
    }

    async fn task_dispatch(&self, instance: &TaskInstance) -> StorageResult<()> {
        let mut s = self.state.lock();
        let task = s.task_mut(instance.task)?;
        if task.state != TaskState::Ready {
            return Err(StorageError::PreconditionFailed(format!(
                "task {} is {}, not ready",
                instance.task, task.state
            )));
        }
        task.state = TaskState::Running;
        s.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn task_finish(
        &self,
        instance: &TaskInstance,
        outputs: &[TaskOutput],
    ) -> StorageResult<()> {
        let mut s = self.state.lock();

        let live = s.live_instance(instance.task).cloned();
        match live {
            Some(live) if live.id == instance.id => {}
            _ => {
                return Err(StorageError::PreconditionFailed(format!(
                    "instance {} is not the live instance of task {}",
                    instance.id, instance.task
                )))
            }
        }

        let job_id = {
            let task = s.task_mut(instance.task)?;
            if task.state != TaskState::Running {
                return Err(StorageError::PreconditionFailed(format!(
                    "task {} is {}, not running",
                    instance.task, task.state
                )));
            }
            if outputs.len() != task.outputs.len() {
                return Err(StorageError::ConstraintViolation(format!(
                    "task {} declared {} outputs but {} were produced",
                    instance.task,
                    task.outputs.len(),
                    outputs.len()
                )));
            }
            for (declared, produced) in task.outputs.iter().zip(outputs) {
                if declared.type_tag() != produced.type_tag() {
                    return Err(StorageError::ConstraintViolation(format!(
                        "output of task {} has type {}, expected {}",
                        instance.task,
                        produced.type_tag(),
                        declared.type_tag()
                    )));
                }
            }

            task.outputs = outputs.to_vec();
            task.state = TaskState::Succeeded;
            task.job.map(|j| j.into_id())
        };

        s.instances.remove(&instance.id);

        if let Some(job_id) = job_id {
            s.promote_ready(job_id);
        }

        Ok(())
    }

    async fn task_fail(&self, instance: &TaskInstance, message: &str) -> StorageResult<()> {
        let mut s = self.state.lock();

        let live = s.live_instance(instance.task).cloned();
        match live {
            Some(live) if live.id == instance.id => {}
            _ => {
                return Err(StorageError::PreconditionFailed(format!(
                    "instance {} is not the live instance of task {}",
                    instance.id, instance.task
                )))
            }
        }

        let task = s.task_mut(instance.task)?;
        if task.state != TaskState::Running {
            return Err(StorageError::PreconditionFailed(format!(
                "task {} is {}, not running",
                instance.task, task.state
            )));
        }

        task.last_error = Some(message.to_owned());
        if task.retries < task.max_retries {
            task.retries += 1;
            task.state = TaskState::Ready;
        } else {
            task.state = TaskState::Failed;
        }

        s.instances.remove(&instance.id);

        Ok(())
    }

    async fn reset_task_for_worker(&self, task_id: ID, worker_id: ID) -> StorageResult<bool> {
        let mut s = self.state.lock();

        let live = s.live_instance(task_id).cloned();
        let Some(live) = live else {
            return Ok(false);
        };
        if live.worker != worker_id {
            return Ok(false);
        }

        let Ok(task) = s.task_mut(task_id) else {
            return Ok(false);
        };
        if task.state != TaskState::Running {
            return Ok(false);
        }

        task.state = TaskState::Ready;
        s.instances.remove(&live.id);
        Ok(true)
    }

    async fn reclaim_task(&self, task_id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();

        let orphaned: Vec<ID> = s
            .instances
            .values()
            .filter(|i| i.task == task_id)
            .map(|i| i.id)
            .collect();
        for iid in orphaned {
            s.instances.remove(&iid);
        }

        let task = s.task_mut(task_id)?;
        if task.state == TaskState::Running {
            task.retries += 1;
            task.state = TaskState::Ready;
        }
        Ok(())
    }

    async fn cancel_task(&self, task_id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();

        let orphaned: Vec<ID> = s
            .instances
            .values()
            .filter(|i| i.task == task_id)
            .map(|i| i.id)
            .collect();
        for iid in orphaned {
            s.instances.remove(&iid);
        }

        let task = s.task_mut(task_id)?;
        if !task.is_terminal() {
            task.state = TaskState::Cancelled;
        }
        Ok(())
    }

    async fn get_task_instance(&self, task_id: ID) -> StorageResult<Option<TaskInstance>> {
        Ok(self.state.lock().live_instance(task_id).cloned())
    }

    async fn get_instances_for_worker(&self, worker_id: ID) -> StorageResult<Vec<TaskInstance>> {
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .filter(|i| i.worker == worker_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DataStorage for MemoryStorage {
    async fn add_driver_data(&self, driver_id: ID, data: &Data) -> StorageResult<()> {
        let mut s = self.state.lock();
        let mut data = data.clone();
        data.owner = DataOwner::Driver(driver_id);
        s.data.insert(data.id, data);
        Ok(())
    }

    async fn add_task_data(&self, task_id: ID, data: &Data) -> StorageResult<()> {
        let mut s = self.state.lock();
        let mut data = data.clone();
        data.owner = DataOwner::Task(task_id);
        s.data.insert(data.id, data);
        Ok(())
    }

    async fn get_data(&self, id: ID) -> StorageResult<Data> {
        let s = self.state.lock();
        s.data
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(format!("no data {id}")))
    }

    async fn remove_data(&self, id: ID) -> StorageResult<()> {
        let mut s = self.state.lock();
        if !s.data.contains_key(&id) {
            return Err(StorageError::KeyNotFound(format!("no data {id}")));
        }

        let referenced = s.tasks.values().any(|t| {
            !t.is_terminal()
                && t.inputs
                    .iter()
                    .any(|i| matches!(i, TaskInput::DataRef { id: d } if *d == id))
        });
        if referenced {
            return Err(StorageError::ConstraintViolation(format!(
                "data {id} is still referenced by a live task input"
            )));
        }

        s.data.remove(&id);
        Ok(())
    }

    async fn set_data_locality(
        &self,
        id: ID,
        locality: &[String],
        hard: bool,
    ) -> StorageResult<()> {
        let mut s = self.state.lock();
        let data = s
            .data
            .get_mut(&id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no data {id}")))?;
        data.locality = locality.to_vec();
        data.hard_locality = hard;
        Ok(())
    }

    async fn set_data_persisted(&self, id: ID, persisted: bool) -> StorageResult<()> {
        let mut s = self.state.lock();
        let data = s
            .data
            .get_mut(&id)
            .ok_or_else(|| StorageError::KeyNotFound(format!("no data {id}")))?;
        data.persisted = persisted;
        Ok(())
    }

    async fn get_data_for_driver(&self, driver_id: ID) -> StorageResult<Vec<Data>> {
        Ok(self
            .state
            .lock()
            .data
            .values()
            .filter(|d| d.owner == DataOwner::Driver(driver_id))
            .cloned()
            .collect())
    }
}
