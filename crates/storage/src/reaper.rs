// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use chrono::Utc;
use dal::StorageResult;
use models::DriverKind;

use crate::{heartbeat::liveness_threshold, DataStorage, MetadataStorage, Storage};

/// One sweep over driver liveness.
///
/// Dead workers have their live task instances reclaimed (task back to
/// Ready, retry counter bumped) so the scheduler can re-dispatch promptly.
/// Dead clients are garbage collected: their jobs are cascade-removed and
/// their non-persisted data dropped. Persisted data outlives its owner.
///
/// Any component may run this; every mutation is individually guarded, so
/// concurrent sweeps are safe.
pub async fn reap(store: &Arc<dyn Storage>) -> StorageResult<usize> {
    let threshold = liveness_threshold();
    let now = Utc::now();

    let mut reclaimed = 0usize;

    for driver in store.get_drivers().await? {
        if !driver.is_dead(now, threshold) {
            continue;
        }

        let driver_id = driver.id.into_id();
        match driver.kind {
            DriverKind::Worker => {
                for instance in store.get_instances_for_worker(driver_id).await? {
                    tracing::info!(
                        "reclaiming task {} from dead worker {driver_id}",
                        instance.task
                    );
                    store.reclaim_task(instance.task).await?;
                    reclaimed += 1;
                }
            }
            DriverKind::Client => {
                for job in store.get_jobs_for_client(driver_id).await? {
                    tracing::info!(
                        "removing job {} of dead client {driver_id}",
                        job.id.into_id()
                    );
                    store.remove_job(job.id.into_id()).await?;
                }
                for data in store.get_data_for_driver(driver_id).await? {
                    if !data.persisted {
                        // May still be referenced by another client's live
                        // job; in that case the refusal is the right call.
                        if let Err(e) = store.remove_data(data.id).await {
                            tracing::debug!("skipping GC of data {}: {e}", data.id);
                        }
                    }
                }
                store.remove_driver(driver_id).await.ok();
            }
            DriverKind::Scheduler => {
                // Nothing is owned by a scheduler row besides itself.
                store.remove_driver(driver_id).await.ok();
            }
        }
    }

    Ok(reclaimed)
}
