// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::StopFlag;
use dal::{StorageResult, ID};
use models::{Driver, DriverKind};
use storage::{heartbeat::heartbeat_loop, reaper::reap, MetadataStorage, Storage};

use crate::{policy::FifoPolicy, server::SchedulerApp};

/// Connects to storage, counting consecutive failures against the
/// configured streak limit before giving up.
pub async fn connect_with_streak(storage_url: &str) -> StorageResult<Arc<dyn Storage>> {
    let limit = config::settings().storage.fail_streak_limit;

    let mut last = None;
    for attempt in 0..limit {
        match storage::connect(storage_url).await {
            Ok(store) => return Ok(store),
            Err(e) => {
                tracing::error!("storage connection attempt {attempt} failed: {e}");
                last = Some(e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    Err(last.expect("at least one attempt was made"))
}

/// Scheduler daemon body: registers the scheduler driver row, runs the
/// heartbeat writer and the liveness reaper, and serves the worker-facing
/// RPC until a stop is requested.
pub async fn entry(
    scheduler_id: ID,
    storage_url: &str,
    host: &str,
    port: u16,
) -> Result<(), anyhow::Error> {
    let store = connect_with_streak(storage_url).await?;

    let address = format!("{host}:{port}");
    store
        .add_driver(&Driver::new(
            scheduler_id,
            DriverKind::Scheduler,
            Some(address.clone()),
        ))
        .await?;

    tracing::info!("scheduler {scheduler_id} registered at {address}");

    let heartbeat = tokio::spawn(heartbeat_loop(store.clone(), scheduler_id));

    let sweep_store = store.clone();
    let sweeper = tokio::spawn(async move {
        let period = Duration::from_secs(
            config::settings().heartbeat.period_secs * config::settings().heartbeat.liveness_factor,
        );
        while !StopFlag::is_stop_requested() {
            tokio::time::sleep(period).await;
            match reap(&sweep_store).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("liveness sweep reclaimed {n} task(s)"),
                Err(e) => tracing::warn!("liveness sweep failed: {e}"),
            }
        }
    });

    let addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow::anyhow!("cannot listen on {address}: {e}"))?;
    let app = Arc::new(SchedulerApp {
        policy: FifoPolicy::new(scheduler_id, store.clone()),
        store: store.clone(),
    });

    let served = crate::server::serve(addr, app).await;

    // A server that fell over on its own must still release the heartbeat
    // loop, which only watches the stop flag.
    if served.is_err() {
        StopFlag::request_stop();
    }

    let _ = heartbeat.await;
    sweeper.abort();

    store.remove_driver(scheduler_id).await.ok();

    served
}
