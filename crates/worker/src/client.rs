// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use chrono::Utc;
use dal::ID;
use models::DriverKind;
use rand::seq::SliceRandom;
use scheduler::rpc::{GetNextTaskRequest, GetNextTaskResponse, TaskAssignment};
use storage::{heartbeat::liveness_threshold, MetadataStorage, Storage};

/// The worker's side of the scheduler request/reply channel.
///
/// Schedulers advertise themselves through their driver rows; each poll
/// picks one live scheduler at random, so workers spread across scheduler
/// instances without any extra coordination.
pub struct WorkerClient {
    http: reqwest::Client,
    store: Arc<dyn Storage>,
    worker_id: ID,
    worker_addr: String,
}

impl WorkerClient {
    pub fn new(store: Arc<dyn Storage>, worker_id: ID, worker_addr: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            worker_id,
            worker_addr,
        }
    }

    pub fn worker_id(&self) -> ID {
        self.worker_id
    }

    async fn pick_scheduler(&self) -> Option<String> {
        let drivers = match self.store.get_drivers().await {
            Ok(drivers) => drivers,
            Err(e) => {
                tracing::warn!("cannot list schedulers: {e}");
                return None;
            }
        };

        let threshold = liveness_threshold();
        let now = Utc::now();
        let live: Vec<String> = drivers
            .into_iter()
            .filter(|d| d.kind == DriverKind::Scheduler && !d.is_dead(now, threshold))
            .filter_map(|d| d.address)
            .collect();

        live.choose(&mut rand::thread_rng()).cloned()
    }

    /// One poll. `last_failed_task_id` rides along on the first poll after
    /// a local failure so the scheduler can reset that task immediately.
    pub async fn get_next_task(
        &self,
        last_failed_task_id: Option<ID>,
    ) -> Option<TaskAssignment> {
        let scheduler = self.pick_scheduler().await?;
        let url = format!("http://{scheduler}/next_task");

        let request = GetNextTaskRequest {
            worker_id: self.worker_id,
            worker_address: self.worker_addr.clone(),
            last_failed_task_id,
        };

        let response = match self.http.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("scheduler {scheduler} unreachable: {e}");
                return None;
            }
        };

        match response.json::<GetNextTaskResponse>().await {
            Ok(body) => body.task,
            Err(e) => {
                tracing::warn!("scheduler {scheduler} sent a bad response: {e}");
                None
            }
        }
    }
}
