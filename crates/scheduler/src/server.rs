// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{extract::State, routing::post, Json, Router};
use common::StopFlag;
use storage::{MetadataStorage, Storage};

use crate::{
    policy::FifoPolicy,
    rpc::{
        AckResponse, CancelRequest, GetNextTaskRequest, GetNextTaskResponse, HeartbeatRequest,
        TaskAssignment,
    },
};

pub struct SchedulerApp {
    pub policy: FifoPolicy,
    pub store: Arc<dyn Storage>,
}

pub fn router(app: Arc<SchedulerApp>) -> Router {
    Router::new()
        .route("/next_task", post(next_task))
        .route("/heartbeat", post(heartbeat))
        .route("/cancel", post(cancel))
        .with_state(app)
}

/// Serves the RPC surface until the stop flag is raised.
pub async fn serve(addr: SocketAddr, app: Arc<SchedulerApp>) -> Result<(), anyhow::Error> {
    tracing::info!("scheduler listening on {addr}");

    axum::Server::bind(&addr)
        .serve(router(app).into_make_service())
        .with_graceful_shutdown(async {
            while !StopFlag::is_stop_requested() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await?;

    Ok(())
}

async fn next_task(
    State(app): State<Arc<SchedulerApp>>,
    Json(req): Json<GetNextTaskRequest>,
) -> Json<GetNextTaskResponse> {
    let assignment = match app
        .policy
        .schedule_next(req.worker_id, &req.worker_address, req.last_failed_task_id)
        .await
    {
        Ok(Some((task_id, instance_id))) => Some(TaskAssignment {
            task_id,
            instance_id,
        }),
        Ok(None) => None,
        Err(e) => {
            tracing::error!("schedule_next failed for worker {}: {e}", req.worker_id);
            None
        }
    };

    Json(GetNextTaskResponse { task: assignment })
}

async fn heartbeat(
    State(app): State<Arc<SchedulerApp>>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<AckResponse> {
    let ok = match app.store.update_heartbeat(req.worker_id).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("heartbeat relay for {} failed: {e}", req.worker_id);
            false
        }
    };
    Json(AckResponse { ok })
}

/// Best-effort cancellation: the task is parked in Cancelled and its live
/// instance invalidated, so any in-flight result commit is rejected by the
/// instance-id match.
async fn cancel(
    State(app): State<Arc<SchedulerApp>>,
    Json(req): Json<CancelRequest>,
) -> Json<AckResponse> {
    let ok = match app.store.cancel_task(req.task_id).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("cancel of task {} failed: {e}", req.task_id);
            false
        }
    };
    Json(AckResponse { ok })
}
