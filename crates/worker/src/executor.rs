// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::process::Stdio;

use dal::ID;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{
    error::{ProtocolError, TaskExecutionError},
    pipe::{receive_message, send_message, ExecutorMessage},
};

/// Parent-side handle on one executor child process.
///
/// The child is this same binary re-invoked with the `executor` subcommand;
/// arguments go down its stdin as one framed message, the result comes back
/// up its stdout the same way.
pub struct TaskExecutor {
    child: Child,
    stdout: ChildStdout,
    function_name: String,
}

impl TaskExecutor {
    pub async fn spawn(
        function_name: &str,
        task_id: ID,
        instance_id: ID,
        storage_url: &str,
        libs: &[String],
        arg_buffers: &[Vec<u8>],
    ) -> Result<Self, TaskExecutionError> {
        let exe = std::env::current_exe().map_err(|e| {
            TaskExecutionError::TaskFailed(format!("cannot locate worker executable: {e}"))
        })?;

        let mut command = Command::new(exe);
        command
            .arg("executor")
            .arg("--func")
            .arg(function_name)
            .arg("--task_id")
            .arg(task_id.to_string())
            .arg("--instance_id")
            .arg(instance_id.to_string())
            .arg("--storage_url")
            .arg(storage_url);
        for lib in libs {
            command.arg("--libs").arg(lib);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            TaskExecutionError::TaskFailed(format!("cannot spawn executor: {e}"))
        })?;

        let mut stdin: ChildStdin = child
            .stdin
            .take()
            .ok_or_else(|| TaskExecutionError::TaskFailed("executor has no stdin".into()))?;
        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskExecutionError::TaskFailed("executor has no stdout".into()))?;

        send_message(&mut stdin, &ExecutorMessage::Args(arg_buffers.to_vec())).await?;
        drop(stdin);

        Ok(Self {
            child,
            stdout,
            function_name: function_name.to_owned(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Reads the child's single response frame and reaps it.
    ///
    /// EOF on the pipe means the child died; both that and a non-zero exit
    /// convert into task failures rather than worker errors, so the loop
    /// keeps going.
    pub async fn wait(mut self) -> Result<Vec<Vec<u8>>, TaskExecutionError> {
        let message = receive_message(&mut self.stdout).await;

        let status = self.child.wait().await.map_err(|e| {
            TaskExecutionError::TaskFailed(format!("cannot reap executor: {e}"))
        })?;

        match message {
            Ok(ExecutorMessage::Result(buffers)) => {
                if status.success() {
                    Ok(buffers)
                } else {
                    Err(TaskExecutionError::TaskFailed(format!(
                        "task {} reported a result but the executor exited with {status}",
                        self.function_name
                    )))
                }
            }
            Ok(ExecutorMessage::Error { function, message }) => Err(
                TaskExecutionError::TaskFailed(format!("task {function} failed: {message}")),
            ),
            Ok(other) => Err(TaskExecutionError::Protocol(ProtocolError::BadFrame(
                format!("unexpected {other:?} from executor"),
            ))),
            Err(ProtocolError::PipeEof) => Err(TaskExecutionError::TaskFailed(format!(
                "executor for task {} exited ({status}) without reporting a result",
                self.function_name
            ))),
            Err(e) => Err(TaskExecutionError::Protocol(e)),
        }
    }
}
