// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! The worker's steady-state loop: poll the scheduler, assemble arguments,
//! run the executor child, commit the outcome.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{ChildPid, StopFlag};
use dal::{retry_on_deadlock, ID};
use models::{Task, TaskInput, TaskInstance, TaskOutput, TaskState, DATA_TYPE_TAG};
use scheduler::rpc::TaskAssignment;
use storage::{DataStorage, MetadataStorage, Storage};

use crate::{
    cache::LruCache,
    client::WorkerClient,
    error::TaskExecutionError,
    executor::TaskExecutor,
};

pub struct WorkerEnv {
    pub worker_id: ID,
    pub worker_addr: String,
    pub storage_url: String,
    pub libs: Vec<String>,
    pub store: Arc<dyn Storage>,
    pub client: WorkerClient,
}

/// Polls until a task arrives or a stop is requested. The failure report,
/// if any, rides only on the first poll.
async fn fetch_task(
    client: &WorkerClient,
    mut fail_task_id: Option<ID>,
    poll_interval: Duration,
) -> Option<TaskAssignment> {
    tracing::debug!("Fetching task");
    while !StopFlag::is_stop_requested() {
        if let Some(assignment) = client.get_next_task(fail_task_id.take()).await {
            return Some(assignment);
        }
        tokio::time::sleep(poll_interval).await;
    }
    None
}

/// Builds the serialized argument tuple for a task: literal bytes, data
/// blob bytes, or the bytes behind an upstream task's output slot.
///
/// Upstream rows are looked up through a small LRU; only Succeeded rows are
/// cached since their outputs are immutable.
pub async fn assemble_args(
    store: &Arc<dyn Storage>,
    task: &Task,
    cache: &mut LruCache<ID, Task>,
) -> Result<Vec<Vec<u8>>, TaskExecutionError> {
    let mut buffers = Vec::with_capacity(task.inputs.len());

    for input in &task.inputs {
        match input {
            TaskInput::Value { value, .. } => buffers.push(value.clone()),
            TaskInput::DataRef { id } => buffers.push(store.get_data(*id).await?.value),
            TaskInput::OutputRef { task: up, index, .. } => {
                let upstream = match cache.get(up) {
                    Some(upstream) => upstream.clone(),
                    None => {
                        let upstream = store.get_task(*up).await?;
                        if upstream.state == TaskState::Succeeded {
                            cache.put(*up, upstream.clone());
                        }
                        upstream
                    }
                };

                let output = upstream.outputs.get(*index).ok_or_else(|| {
                    TaskExecutionError::OutputUnavailable(format!(
                        "task {up} has no output slot {index}"
                    ))
                })?;

                match output {
                    TaskOutput::Value { value, .. } => buffers.push(value.clone()),
                    TaskOutput::Data { id } => buffers.push(store.get_data(*id).await?.value),
                    TaskOutput::Pending { .. } => {
                        return Err(TaskExecutionError::OutputUnavailable(format!(
                            "output {index} of task {up} has not been produced"
                        )))
                    }
                }
            }
        }
    }

    Ok(buffers)
}

/// Interprets result buffers by the declared output types: a `data` slot
/// carries the UUID of a blob the task created, anything else is stored as
/// literal bytes under the declared tag.
pub fn parse_outputs(
    task: &Task,
    result_buffers: &[Vec<u8>],
) -> Result<Vec<TaskOutput>, TaskExecutionError> {
    if result_buffers.len() != task.outputs.len() {
        return Err(TaskExecutionError::OutputInvalid(format!(
            "task {} declared {} outputs but returned {}",
            task.function_name,
            task.outputs.len(),
            result_buffers.len()
        )));
    }

    let mut outputs = Vec::with_capacity(result_buffers.len());
    for (declared, buffer) in task.outputs.iter().zip(result_buffers) {
        if declared.type_tag() == DATA_TYPE_TAG {
            let id: uuid::Uuid = models::decode_value(buffer).map_err(|_| {
                TaskExecutionError::OutputInvalid(format!(
                    "task {} failed to parse result as data id",
                    task.function_name
                ))
            })?;
            outputs.push(TaskOutput::Data { id: ID::from(id) });
        } else {
            outputs.push(TaskOutput::Value {
                type_tag: declared.type_tag().to_owned(),
                value: buffer.clone(),
            });
        }
    }

    Ok(outputs)
}

/// Commits one execution outcome. Returns whether the commit succeeded;
/// the caller turns a `false` into a failure report on the next poll.
async fn handle_executor_result(
    env: &WorkerEnv,
    instance: &TaskInstance,
    task: &Task,
    outcome: Result<Vec<Vec<u8>>, TaskExecutionError>,
) -> bool {
    match outcome {
        Ok(result_buffers) => {
            let outputs = match parse_outputs(task, &result_buffers) {
                Ok(outputs) => outputs,
                Err(e) => {
                    tracing::error!("{e}");
                    let _ = env.store.task_fail(instance, &e.to_string()).await;
                    return false;
                }
            };

            tracing::debug!("Submitting result for task {}", task.id);
            let retries = config::settings().worker.task_finish_retries;
            let store = &env.store;
            let result =
                retry_on_deadlock(retries, || store.task_finish(instance, &outputs)).await;

            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Submit task {} fails: {e}", task.function_name);
                    false
                }
            }
        }
        Err(e) => {
            tracing::warn!("Task {} failed: {e}", task.function_name);
            if let Err(commit) = env.store.task_fail(instance, &e.to_string()).await {
                tracing::error!("Recording failure of {} failed too: {commit}", task.id);
            }
            false
        }
    }
}

pub async fn task_loop(env: &WorkerEnv) {
    let poll_interval = Duration::from_millis(config::settings().worker.poll_interval_ms);
    let mut cache: LruCache<ID, Task> = LruCache::default();
    let mut fail_task_id: Option<ID> = None;

    while !StopFlag::is_stop_requested() {
        let Some(assignment) =
            fetch_task(&env.client, fail_task_id.take(), poll_interval).await
        else {
            continue;
        };

        let instance = TaskInstance {
            id: assignment.instance_id,
            task: assignment.task_id,
            worker: env.worker_id,
            started_at: Utc::now(),
        };
        tracing::debug!("Fetched task {}", assignment.task_id);

        let task = match env.store.get_task(assignment.task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!("Failed to fetch task detail: {e}");
                fail_task_id = Some(assignment.task_id);
                continue;
            }
        };

        let args = match assemble_args(&env.store, &task, &mut cache).await {
            Ok(args) => args,
            Err(e) => {
                tracing::error!("Failed to fetch task arguments: {e}");
                let _ = env
                    .store
                    .task_fail(&instance, "Failed to fetch task arguments")
                    .await;
                fail_task_id = Some(task.id);
                continue;
            }
        };

        let executor = match TaskExecutor::spawn(
            &task.function_name,
            task.id,
            instance.id,
            &env.storage_url,
            &env.libs,
            &args,
        )
        .await
        {
            Ok(executor) => executor,
            Err(e) => {
                tracing::error!("Failed to start executor for {}: {e}", task.function_name);
                let _ = env.store.task_fail(&instance, &e.to_string()).await;
                fail_task_id = Some(task.id);
                continue;
            }
        };

        if let Some(pid) = executor.pid() {
            ChildPid::set_pid(pid as i32);
            // Double check the flag to close the window where SIGTERM
            // arrived between spawn and registration.
            if StopFlag::is_stop_requested() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }

        let outcome = executor.wait().await;
        ChildPid::clear();

        let committed = handle_executor_result(env, &instance, &task, outcome).await;
        fail_task_id = if committed { None } else { Some(task.id) };
    }
}
