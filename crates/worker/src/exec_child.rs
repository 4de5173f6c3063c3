// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Child-process half of task execution.
//!
//! Bootstrap: resolve the function in the registry, connect to storage for
//! the task's scoped data access, read the framed argument tuple from
//! stdin, run the function on a blocking thread, write the framed result
//! (or error) to stdout. Exit code 0 means a response frame was delivered;
//! anything else is an uncaught failure the parent maps to a task failure.

use dal::ID;

use crate::{
    pipe::{create_error_response, create_result_response, receive_message, send_message,
        ExecutorMessage},
    registry::{TaskContext, TaskRegistry},
};

pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGS: i32 = 1;
pub const EXIT_PROTOCOL: i32 = 2;
pub const EXIT_STORAGE: i32 = 4;
pub const EXIT_TASK: i32 = 6;

pub struct ExecutorArgs {
    pub func: String,
    pub task_id: ID,
    pub instance_id: ID,
    pub storage_url: String,
    pub libs: Vec<String>,
}

pub async fn executor_main(args: ExecutorArgs) -> i32 {
    let registry = match TaskRegistry::load(&args.libs) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("cannot load task libraries: {e}");
            return EXIT_BAD_ARGS;
        }
    };

    let Some(function) = registry.get(&args.func) else {
        tracing::error!("no registered task function named {}", args.func);
        return EXIT_BAD_ARGS;
    };

    let store = match storage::connect(&args.storage_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("executor cannot reach storage: {e}");
            return EXIT_STORAGE;
        }
    };

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let buffers = match receive_message(&mut stdin).await {
        Ok(ExecutorMessage::Args(buffers)) => buffers,
        Ok(ExecutorMessage::Cancel) => {
            tracing::info!("cancelled before execution");
            return EXIT_OK;
        }
        Ok(other) => {
            tracing::error!("expected an Args frame, got {other:?}");
            return EXIT_PROTOCOL;
        }
        Err(e) => {
            tracing::error!("cannot read argument frame: {e}");
            return EXIT_PROTOCOL;
        }
    };

    let data_store: std::sync::Arc<dyn storage::DataStorage> = store;
    let context = TaskContext::new(
        args.task_id,
        args.instance_id,
        data_store,
        tokio::runtime::Handle::current(),
    );

    let call = function.call;
    let outcome =
        tokio::task::spawn_blocking(move || call(&context, &buffers)).await;

    let (response, code) = match outcome {
        Ok(Ok(result_buffers)) => (create_result_response(result_buffers), EXIT_OK),
        Ok(Err(e)) => {
            tracing::warn!("task function {} failed: {e}", args.func);
            (create_error_response(&args.func, e.to_string()), EXIT_TASK)
        }
        Err(join_error) => {
            tracing::error!("task function {} panicked: {join_error}", args.func);
            (
                create_error_response(&args.func, format!("panic: {join_error}")),
                EXIT_TASK,
            )
        }
    };

    if let Err(e) = send_message(&mut stdout, &response).await {
        tracing::error!("cannot write response frame: {e}");
        return EXIT_PROTOCOL;
    }

    code
}
