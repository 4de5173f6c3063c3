// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Client-side driver surface: connect to the cluster's store, create data
//! blobs, submit task graphs, and watch jobs run.

use std::{sync::Arc, time::Duration};

use dal::{StorageResult, ID};
use models::{
    Data, DataOwner, Driver, DriverKind, JobStatus, TaskGraph, TaskOutput, TaskState,
};
use storage::{DataStorage, MetadataStorage, Storage};

/// A connected client. Registers a driver row on creation; everything the
/// client owns (jobs, non-persisted data) is garbage collected if this
/// driver's heartbeat goes stale, so long-lived clients should run
/// [`SpiderDriver::heartbeat_forever`] in the background.
pub struct SpiderDriver {
    client_id: ID,
    store: Arc<dyn Storage>,
}

impl SpiderDriver {
    pub async fn connect(storage_url: &str) -> StorageResult<Self> {
        let store = storage::connect(storage_url).await?;
        Self::with_store(store).await
    }

    /// Attaches to an already-open store; this is also the seam the test
    /// harness uses with the in-memory backend.
    pub async fn with_store(store: Arc<dyn Storage>) -> StorageResult<Self> {
        let client_id = ID::new();
        store
            .add_driver(&Driver::new(client_id, DriverKind::Client, None))
            .await?;

        tracing::debug!("client driver {client_id} registered");

        Ok(Self { client_id, store })
    }

    pub fn client_id(&self) -> ID {
        self.client_id
    }

    pub fn store(&self) -> Arc<dyn Storage> {
        self.store.clone()
    }

    /// Keeps this client's driver row alive; run on a background task.
    pub async fn heartbeat_forever(&self) {
        storage::heartbeat::heartbeat_loop(self.store.clone(), self.client_id).await;
    }

    /// Creates a plain data blob owned by this client.
    pub async fn add_data(&self, value: Vec<u8>) -> StorageResult<ID> {
        self.data_builder().build(value).await
    }

    pub fn data_builder(&self) -> DataBuilder<'_> {
        DataBuilder {
            driver: self,
            persisted: false,
            hard_locality: false,
            locality: Vec::new(),
        }
    }

    /// Validates and submits a graph, returning a handle on the new job.
    pub async fn submit_job(&self, graph: &TaskGraph) -> StorageResult<JobHandle> {
        let job_id = ID::new();
        self.store.add_job(job_id, self.client_id, graph).await?;

        tracing::info!("submitted job {job_id} with {} task(s)", graph.task_count());

        Ok(JobHandle {
            job_id,
            store: self.store.clone(),
        })
    }

    pub async fn remove_job(&self, job_id: ID) -> StorageResult<()> {
        self.store.remove_job(job_id).await
    }

    /// Re-plans a job that is in a mixed state after failures. Returns the
    /// tasks that can run again immediately and those still waiting on
    /// upstream work; dispatching is left to the schedulers.
    pub async fn recover_job(&self, job_id: ID) -> StorageResult<(Vec<ID>, Vec<ID>)> {
        let mut recovery = scheduler::JobRecovery::new(job_id, self.store.clone());
        recovery.compute().await?;
        Ok((
            recovery.ready_tasks().to_vec(),
            recovery.pending_tasks().to_vec(),
        ))
    }
}

pub struct DataBuilder<'a> {
    driver: &'a SpiderDriver,
    persisted: bool,
    hard_locality: bool,
    locality: Vec<String>,
}

impl<'a> DataBuilder<'a> {
    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn hard_locality(mut self, hard: bool) -> Self {
        self.hard_locality = hard;
        self
    }

    pub fn locality(mut self, locality: Vec<String>) -> Self {
        self.locality = locality;
        self
    }

    pub async fn build(self, value: Vec<u8>) -> StorageResult<ID> {
        let mut data = Data::new(value, DataOwner::Driver(self.driver.client_id));
        data.set_persisted(self.persisted);
        data.set_hard_locality(self.hard_locality);
        data.set_locality(self.locality);
        let id = data.id;

        self.driver
            .store
            .add_driver_data(self.driver.client_id, &data)
            .await?;
        Ok(id)
    }
}

/// Handle on one submitted job.
pub struct JobHandle {
    job_id: ID,
    store: Arc<dyn Storage>,
}

impl JobHandle {
    pub fn id(&self) -> ID {
        self.job_id
    }

    pub async fn status(&self) -> StorageResult<JobStatus> {
        self.store.get_job_status(self.job_id).await
    }

    /// Polls until the job leaves the Running state.
    pub async fn wait_complete(&self) -> StorageResult<JobStatus> {
        let poll = Duration::from_millis(config::settings().worker.poll_interval_ms);
        loop {
            let status = self.status().await?;
            if status != JobStatus::Running {
                return Ok(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// The written output buffers of the job's output tasks, in task order.
    /// `data`-typed outputs yield the blob's bytes.
    pub async fn result_values(&self) -> StorageResult<Vec<Vec<u8>>> {
        let outputs = self.store.get_job_output_tasks(self.job_id).await?;

        let mut values = Vec::new();
        for task in outputs {
            for output in &task.outputs {
                match output {
                    TaskOutput::Value { value, .. } => values.push(value.clone()),
                    TaskOutput::Data { id } => {
                        values.push(self.store.get_data(*id).await?.value)
                    }
                    TaskOutput::Pending { .. } => {}
                }
            }
        }
        Ok(values)
    }

    /// The error message and function name of the first failed task, if
    /// the job failed.
    pub async fn error(&self) -> StorageResult<Option<(String, String)>> {
        let tasks = self.store.get_job_tasks(self.job_id).await?;
        for task in tasks {
            if task.state == TaskState::Failed {
                return Ok(Some((
                    task.last_error.unwrap_or_else(|| "unknown error".to_owned()),
                    task.function_name,
                )));
            }
        }
        Ok(None)
    }
}
