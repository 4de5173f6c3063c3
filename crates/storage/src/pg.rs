// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Postgres-backed storage. One tokio-postgres connection guarded by an
//! async mutex; each trait operation runs inside a single
//! [`EasyTransaction`], so its effects become visible atomically and
//! deadlock-class failures surface as [`StorageError::Deadlock`] for the
//! caller's retry loop.

use async_trait::async_trait;
use dal::{
    AsEasyTransaction, ClientPair, DBTable, EasyTransaction, ExistingRow, FKey, NewRow,
    SchrodingerRow, StorageError, StorageResult, ID,
};
use models::{
    Data, DataOwner, Driver, Job, JobStatus, Task, TaskGraph, TaskInstance, TaskInput,
    TaskOutput, TaskState,
};
use tokio::sync::Mutex;

use crate::{derive_job_status, DataStorage, MetadataStorage};

pub struct PgStorage {
    client: Mutex<ClientPair>,
}

impl PgStorage {
    pub async fn connect(storage_url: &str) -> StorageResult<Self> {
        let client = dal::new_client(storage_url).await?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Creates the schema if it does not exist yet. Run once via
    /// `spider init` before the first daemon starts.
    pub async fn initialize(&self) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        t.batch_execute(
            "CREATE TABLE IF NOT EXISTS drivers (
                 id UUID PRIMARY KEY,
                 kind JSONB NOT NULL,
                 address TEXT,
                 heartbeat TIMESTAMPTZ NOT NULL
             );
             CREATE TABLE IF NOT EXISTS jobs (
                 id UUID PRIMARY KEY,
                 client_id UUID NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tasks (
                 id UUID PRIMARY KEY,
                 job_id UUID REFERENCES jobs(id) ON DELETE CASCADE,
                 function_name TEXT NOT NULL,
                 inputs JSONB NOT NULL,
                 outputs JSONB NOT NULL,
                 state JSONB NOT NULL,
                 retries INT NOT NULL,
                 max_retries INT NOT NULL,
                 last_error TEXT
             );
             CREATE INDEX IF NOT EXISTS tasks_state_idx ON tasks (state);
             CREATE INDEX IF NOT EXISTS tasks_job_idx ON tasks (job_id);
             CREATE TABLE IF NOT EXISTS task_instances (
                 id UUID PRIMARY KEY,
                 task_id UUID NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                 worker_id UUID NOT NULL,
                 started_at TIMESTAMPTZ NOT NULL
             );
             CREATE INDEX IF NOT EXISTS task_instances_task_idx
                 ON task_instances (task_id);
             CREATE TABLE IF NOT EXISTS data (
                 id UUID PRIMARY KEY,
                 value BYTEA NOT NULL,
                 owner JSONB NOT NULL,
                 persisted BOOLEAN NOT NULL,
                 hard_locality BOOLEAN NOT NULL,
                 locality JSONB NOT NULL
             );",
        )
        .await?;

        t.commit().await
    }

    fn state_value(state: TaskState) -> serde_json::Value {
        serde_json::to_value(state).expect("task states always serialize")
    }
}

/// Tasks of `job_id`, loaded inside the caller's transaction.
async fn job_tasks(t: &mut EasyTransaction<'_>, job_id: ID) -> StorageResult<Vec<Task>> {
    let rows = Task::select()
        .where_field("job_id")
        .equals(job_id)
        .run(t)
        .await?;
    Ok(rows.into_iter().map(ExistingRow::into_inner).collect())
}

/// The live instance for a task, if any, inside the caller's transaction.
async fn live_instance(
    t: &mut EasyTransaction<'_>,
    task_id: ID,
) -> StorageResult<Option<TaskInstance>> {
    let rows = TaskInstance::select()
        .where_field("task_id")
        .equals(task_id)
        .run(t)
        .await?;
    Ok(rows.into_iter().map(ExistingRow::into_inner).next())
}

/// Flips Pending tasks of the job whose inputs all resolved to Ready, inside
/// the same transaction that made an upstream output visible.
async fn promote_ready(t: &mut EasyTransaction<'_>, job_id: ID) -> StorageResult<()> {
    let tasks = job_tasks(t, job_id).await?;

    let output_written = |task_id: ID, index: usize| {
        tasks
            .iter()
            .find(|task| task.id == task_id)
            .map(|task| {
                task.state == TaskState::Succeeded
                    && task
                        .outputs
                        .get(index)
                        .map(TaskOutput::is_written)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    };

    for task in &tasks {
        if task.state != TaskState::Pending {
            continue;
        }
        let resolved = task.inputs.iter().all(|input| match input {
            TaskInput::Value { .. } | TaskInput::DataRef { .. } => true,
            TaskInput::OutputRef { task, index, .. } => output_written(*task, *index),
        });
        if resolved {
            t.execute(
                "UPDATE tasks SET state = $1 WHERE id = $2;",
                &[&PgStorage::state_value(TaskState::Ready), &task.id],
            )
            .await?;
        }
    }

    Ok(())
}

/// Tasks of the job that no other task of the job consumes.
fn output_tasks_of(tasks: &[Task]) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|t| {
            !tasks.iter().any(|other| {
                other
                    .inputs
                    .iter()
                    .any(|i| matches!(i, TaskInput::OutputRef { task, .. } if *task == t.id))
            })
        })
        .collect()
}

#[async_trait]
impl MetadataStorage for PgStorage {
    async fn add_driver(&self, driver: &Driver) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        SchrodingerRow::new(driver.clone()).upsert(&mut t).await?;
        t.commit().await
    }

    async fn remove_driver(&self, id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let n = t.execute("DELETE FROM drivers WHERE id = $1;", &[&id]).await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no driver {id}")));
        }
        t.commit().await
    }

    async fn update_heartbeat(&self, id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let n = t
            .execute("UPDATE drivers SET heartbeat = now() WHERE id = $1;", &[&id])
            .await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no driver {id}")));
        }
        t.commit().await
    }

    async fn get_driver(&self, id: ID) -> StorageResult<Driver> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let driver = Driver::get(&mut t, id).await?.into_inner();
        t.commit().await?;
        Ok(driver)
    }

    async fn get_drivers(&self) -> StorageResult<Vec<Driver>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let drivers = Driver::select().run(&mut t).await?;
        t.commit().await?;
        Ok(drivers.into_iter().map(ExistingRow::into_inner).collect())
    }

    async fn add_job(&self, job_id: ID, client_id: ID, graph: &TaskGraph) -> StorageResult<()> {
        graph
            .validate()
            .map_err(|e| StorageError::ConstraintViolation(e.to_string()))?;

        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        NewRow::new(Job::new(job_id, client_id)).insert(&mut t).await?;

        for task in graph.tasks() {
            let mut task = task.clone();
            task.job = Some(FKey::from_id(job_id));
            task.state = if task
                .inputs
                .iter()
                .all(|i| !matches!(i, TaskInput::OutputRef { .. }))
            {
                TaskState::Ready
            } else {
                TaskState::Pending
            };
            NewRow::new(task).insert(&mut t).await?;
        }

        t.commit().await
    }

    async fn remove_job(&self, job_id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        let tasks = job_tasks(&mut t, job_id).await?;
        for task in &tasks {
            let owner = serde_json::to_value(DataOwner::Task(task.id))
                .map_err(|e| StorageError::Other(e.to_string()))?;
            t.execute("DELETE FROM data WHERE owner = $1;", &[&owner]).await?;
        }

        // Tasks and instances go with the job via FK cascade.
        let n = t.execute("DELETE FROM jobs WHERE id = $1;", &[&job_id]).await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no job {job_id}")));
        }

        t.commit().await
    }

    async fn get_job(&self, job_id: ID) -> StorageResult<Job> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let job = Job::get(&mut t, job_id).await?.into_inner();
        t.commit().await?;
        Ok(job)
    }

    async fn get_jobs_for_client(&self, client_id: ID) -> StorageResult<Vec<Job>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let jobs = Job::select()
            .where_field("client_id")
            .equals(client_id)
            .run(&mut t)
            .await?;
        t.commit().await?;
        Ok(jobs.into_iter().map(ExistingRow::into_inner).collect())
    }

    async fn get_job_status(&self, job_id: ID) -> StorageResult<JobStatus> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        Job::get(&mut t, job_id).await?;
        let tasks = job_tasks(&mut t, job_id).await?;
        t.commit().await?;

        let outputs = output_tasks_of(&tasks);
        Ok(derive_job_status(&tasks, &outputs))
    }

    async fn get_job_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        Job::get(&mut t, job_id).await?;
        let tasks = job_tasks(&mut t, job_id).await?;
        t.commit().await?;
        Ok(tasks)
    }

    async fn get_job_output_tasks(&self, job_id: ID) -> StorageResult<Vec<Task>> {
        let tasks = self.get_job_tasks(job_id).await?;
        let ids: Vec<ID> = output_tasks_of(&tasks).iter().map(|t| t.id).collect();
        Ok(tasks.into_iter().filter(|t| ids.contains(&t.id)).collect())
    }

    async fn get_task(&self, task_id: ID) -> StorageResult<Task> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let task = Task::get(&mut t, task_id).await?.into_inner();
        t.commit().await?;
        Ok(task)
    }

    async fn set_task_state(&self, task_id: ID, state: TaskState) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let n = t
            .execute(
                "UPDATE tasks SET state = $1 WHERE id = $2;",
                &[&Self::state_value(state), &task_id],
            )
            .await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no task {task_id}")));
        }
        t.commit().await
    }

    async fn get_ready_tasks(&self) -> StorageResult<Vec<Task>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let rows = t
            .query(
                "SELECT t.* FROM tasks t
                     JOIN jobs j ON t.job_id = j.id
                     WHERE t.state = $1
                     ORDER BY j.created_at ASC, t.id ASC;",
                &[&Self::state_value(TaskState::Ready)],
            )
            .await?;
        t.commit().await?;

        let tasks = Task::from_rows(rows)?;
        Ok(tasks.into_iter().map(ExistingRow::into_inner).collect())
    }

    async fn task_dispatch(&self, instance: &TaskInstance) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        // Compare-and-set on the state column; losing a race with another
        // scheduler shows up as zero affected rows.
        let n = t
            .execute(
                "UPDATE tasks SET state = $1 WHERE id = $2 AND state = $3;",
                &[
                    &Self::state_value(TaskState::Running),
                    &instance.task,
                    &Self::state_value(TaskState::Ready),
                ],
            )
            .await?;
        if n == 0 {
            return Err(StorageError::PreconditionFailed(format!(
                "task {} was not ready to dispatch",
                instance.task
            )));
        }

        NewRow::new(instance.clone()).insert(&mut t).await?;
        t.commit().await
    }

    async fn task_finish(
        &self,
        instance: &TaskInstance,
        outputs: &[TaskOutput],
    ) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        match live_instance(&mut t, instance.task).await? {
            Some(live) if live.id == instance.id => {}
            _ => {
                return Err(StorageError::PreconditionFailed(format!(
                    "instance {} is not the live instance of task {}",
                    instance.id, instance.task
                )))
            }
        }

        let mut task = Task::get(&mut t, instance.task).await?;
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
        let job = task.job;
        task.update(&mut t).await?;

        t.execute("DELETE FROM task_instances WHERE id = $1;", &[&instance.id])
            .await?;

        if let Some(job) = job {
            promote_ready(&mut t, job.into_id()).await?;
        }

        t.commit().await
    }

    async fn task_fail(&self, instance: &TaskInstance, message: &str) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        match live_instance(&mut t, instance.task).await? {
            Some(live) if live.id == instance.id => {}
            _ => {
                return Err(StorageError::PreconditionFailed(format!(
                    "instance {} is not the live instance of task {}",
                    instance.id, instance.task
                )))
            }
        }

        let mut task = Task::get(&mut t, instance.task).await?;
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
        task.update(&mut t).await?;

        t.execute("DELETE FROM task_instances WHERE id = $1;", &[&instance.id])
            .await?;

        t.commit().await
    }

    async fn reset_task_for_worker(&self, task_id: ID, worker_id: ID) -> StorageResult<bool> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        let Some(live) = live_instance(&mut t, task_id).await? else {
            return Ok(false);
        };
        if live.worker != worker_id {
            return Ok(false);
        }

        let n = t
            .execute(
                "UPDATE tasks SET state = $1 WHERE id = $2 AND state = $3;",
                &[
                    &Self::state_value(TaskState::Ready),
                    &task_id,
                    &Self::state_value(TaskState::Running),
                ],
            )
            .await?;
        if n == 0 {
            return Ok(false);
        }

        t.execute("DELETE FROM task_instances WHERE id = $1;", &[&live.id])
            .await?;
        t.commit().await?;
        Ok(true)
    }

    async fn reclaim_task(&self, task_id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        t.execute("DELETE FROM task_instances WHERE task_id = $1;", &[&task_id])
            .await?;
        t.execute(
            "UPDATE tasks SET state = $1, retries = retries + 1
                 WHERE id = $2 AND state = $3;",
            &[
                &Self::state_value(TaskState::Ready),
                &task_id,
                &Self::state_value(TaskState::Running),
            ],
        )
        .await?;

        t.commit().await
    }

    async fn cancel_task(&self, task_id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        t.execute("DELETE FROM task_instances WHERE task_id = $1;", &[&task_id])
            .await?;

        let mut task = Task::get(&mut t, task_id).await?;
        if !task.is_terminal() {
            task.state = TaskState::Cancelled;
            task.update(&mut t).await?;
        }

        t.commit().await
    }

    async fn get_task_instance(&self, task_id: ID) -> StorageResult<Option<TaskInstance>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let live = live_instance(&mut t, task_id).await?;
        t.commit().await?;
        Ok(live)
    }

    async fn get_instances_for_worker(&self, worker_id: ID) -> StorageResult<Vec<TaskInstance>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let rows = TaskInstance::select()
            .where_field("worker_id")
            .equals(worker_id)
            .run(&mut t)
            .await?;
        t.commit().await?;
        Ok(rows.into_iter().map(ExistingRow::into_inner).collect())
    }
}

#[async_trait]
impl DataStorage for PgStorage {
    async fn add_driver_data(&self, driver_id: ID, data: &Data) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let mut data = data.clone();
        data.owner = DataOwner::Driver(driver_id);
        NewRow::new(data).insert(&mut t).await?;
        t.commit().await
    }

    async fn add_task_data(&self, task_id: ID, data: &Data) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let mut data = data.clone();
        data.owner = DataOwner::Task(task_id);
        NewRow::new(data).insert(&mut t).await?;
        t.commit().await
    }

    async fn get_data(&self, id: ID) -> StorageResult<Data> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let data = Data::get(&mut t, id).await?.into_inner();
        t.commit().await?;
        Ok(data)
    }

    async fn remove_data(&self, id: ID) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;

        Data::get(&mut t, id).await?;

        // A data row is pinned while any non-terminal task still names it in
        // a data-ref input.
        let reference = serde_json::json!([{ "kind": "data_ref", "id": id }]);
        let row = t
            .query_one(
                "SELECT COUNT(*) AS refs FROM tasks
                     WHERE inputs @> $1
                       AND state != $2 AND state != $3 AND state != $4;",
                &[
                    &reference,
                    &Self::state_value(TaskState::Succeeded),
                    &Self::state_value(TaskState::Failed),
                    &Self::state_value(TaskState::Cancelled),
                ],
            )
            .await?;
        let refs: i64 = row
            .try_get("refs")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        if refs > 0 {
            return Err(StorageError::ConstraintViolation(format!(
                "data {id} is still referenced by a live task input"
            )));
        }

        t.execute("DELETE FROM data WHERE id = $1;", &[&id]).await?;
        t.commit().await
    }

    async fn set_data_locality(
        &self,
        id: ID,
        locality: &[String],
        hard: bool,
    ) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let locality = serde_json::to_value(locality)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let n = t
            .execute(
                "UPDATE data SET locality = $1, hard_locality = $2 WHERE id = $3;",
                &[&locality, &hard, &id],
            )
            .await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no data {id}")));
        }
        t.commit().await
    }

    async fn set_data_persisted(&self, id: ID, persisted: bool) -> StorageResult<()> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let n = t
            .execute(
                "UPDATE data SET persisted = $1 WHERE id = $2;",
                &[&persisted, &id],
            )
            .await?;
        if n == 0 {
            return Err(StorageError::KeyNotFound(format!("no data {id}")));
        }
        t.commit().await
    }

    async fn get_data_for_driver(&self, driver_id: ID) -> StorageResult<Vec<Data>> {
        let mut client = self.client.lock().await;
        let mut t = client.easy_transaction().await?;
        let owner = serde_json::to_value(DataOwner::Driver(driver_id))
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let rows = t.query("SELECT * FROM data WHERE owner = $1;", &[&owner]).await?;
        t.commit().await?;

        let data = Data::from_rows(rows)?;
        Ok(data.into_iter().map(ExistingRow::into_inner).collect())
    }
}
