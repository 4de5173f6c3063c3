// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use dal::ID;
use models::{Driver, DriverKind};
use scheduler::entry::connect_with_streak;
use storage::{heartbeat::heartbeat_loop, MetadataStorage};
use tokio::signal::unix::{signal, SignalKind};

use common::{ChildPid, StopFlag};

use crate::{
    client::WorkerClient,
    error::WorkerError,
    registry::TaskRegistry,
    task_loop::{task_loop, WorkerEnv},
};

pub struct WorkerArgs {
    pub worker_id: ID,
    pub storage_url: String,
    pub host: String,
    pub libs: Vec<String>,
}

/// Worker daemon body: registry checks, SIGTERM watcher, driver
/// registration, then the heartbeat writer and the task loop side by side.
pub async fn entry(args: WorkerArgs) -> Result<(), WorkerError> {
    let registry = TaskRegistry::load(&args.libs)?;
    if registry.is_empty() {
        tracing::warn!("no task functions enabled; this worker can only idle");
    } else {
        tracing::info!("registered task functions: {:?}", registry.names());
    }

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| WorkerError::SignalInstallFailed(e.to_string()))?;
    tokio::spawn(async move {
        sigterm.recv().await;
        tracing::info!("SIGTERM received, requesting stop");
        StopFlag::request_stop();
        let pid = ChildPid::get_pid();
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    });

    let store = connect_with_streak(&args.storage_url)
        .await
        .map_err(WorkerError::StorageConnect)?;

    let worker_id = args.worker_id;
    store
        .add_driver(&Driver::new(
            worker_id,
            DriverKind::Worker,
            Some(args.host.clone()),
        ))
        .await?;

    tracing::info!("worker {worker_id} registered at {}", args.host);

    let heartbeat = tokio::spawn(heartbeat_loop(store.clone(), worker_id));

    let client = WorkerClient::new(store.clone(), worker_id, args.host.clone());
    let env = WorkerEnv {
        worker_id,
        worker_addr: args.host.clone(),
        storage_url: args.storage_url.clone(),
        libs: args.libs.clone(),
        store: store.clone(),
        client,
    };

    task_loop(&env).await;

    let _ = heartbeat.await;

    Ok(())
}
