// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use dal::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Row;

use crate::{job::Job, DATA_TYPE_TAG};

/// One node of a task graph: a named function plus its typed input and
/// output slots.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Task {
    pub id: ID,

    /// Set when the owning job row is created; graphs under construction
    /// have no job yet.
    pub job: Option<FKey<Job>>,

    /// Key into the worker's registered-task table.
    pub function_name: String,

    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,

    pub state: TaskState,

    pub retries: i32,
    pub max_retries: i32,

    /// Message recorded by the most recent failure, if any.
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            id: ID::new(),
            job: None,
            function_name: function_name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            state: TaskState::Pending,
            retries: 0,
            max_retries: 0,
            last_error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn add_input(&mut self, input: TaskInput) {
        self.inputs.push(input);
    }

    pub fn add_output(&mut self, output: TaskOutput) {
        self.outputs.push(output);
    }

    /// A task is ready when every task-output edge among its inputs has a
    /// written upstream slot; literals and data references always resolve.
    /// The caller supplies upstream lookups through `output_written`.
    pub fn inputs_resolved(&self, mut output_written: impl FnMut(ID, usize) -> bool) -> bool {
        self.inputs.iter().all(|input| match input {
            TaskInput::Value { .. } | TaskInput::DataRef { .. } => true,
            TaskInput::OutputRef { task, index, .. } => output_written(*task, *index),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Binding of one input slot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    /// A literal argument, already serialized.
    Value {
        type_tag: String,
        #[serde(with = "crate::codec::bytes_b64")]
        value: Vec<u8>,
    },

    /// A reference into the blob store.
    DataRef { id: ID },

    /// An edge from an upstream task's output slot.
    OutputRef {
        task: ID,
        index: usize,
        type_tag: String,
    },
}

impl TaskInput {
    pub fn literal<T: Serialize + crate::TypeTag>(
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::Value {
            type_tag: T::TYPE_TAG.to_owned(),
            value: crate::encode_value(value)?,
        })
    }

    pub fn data(id: ID) -> Self {
        Self::DataRef { id }
    }

    pub fn type_tag(&self) -> &str {
        match self {
            TaskInput::Value { type_tag, .. } => type_tag,
            TaskInput::DataRef { .. } => DATA_TYPE_TAG,
            TaskInput::OutputRef { type_tag, .. } => type_tag,
        }
    }
}

/// State of one output slot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    /// Declared but not yet produced.
    Pending { type_tag: String },

    /// A literal result value.
    Value {
        type_tag: String,
        #[serde(with = "crate::codec::bytes_b64")]
        value: Vec<u8>,
    },

    /// A data blob produced by the task.
    Data { id: ID },
}

impl TaskOutput {
    pub fn declared<T: crate::TypeTag>() -> Self {
        Self::Pending {
            type_tag: T::TYPE_TAG.to_owned(),
        }
    }

    pub fn declared_tag(type_tag: impl Into<String>) -> Self {
        Self::Pending {
            type_tag: type_tag.into(),
        }
    }

    pub fn type_tag(&self) -> &str {
        match self {
            TaskOutput::Pending { type_tag } | TaskOutput::Value { type_tag, .. } => type_tag,
            TaskOutput::Data { .. } => DATA_TYPE_TAG,
        }
    }

    pub fn is_written(&self) -> bool {
        !matches!(self, TaskOutput::Pending { .. })
    }
}

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// A single execution attempt of a task by a worker. A task may accumulate
/// instances across retries, but only the latest one may commit results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskInstance {
    pub id: ID,
    pub task: ID,
    pub worker: ID,
    pub started_at: DateTime<Utc>,
}

impl TaskInstance {
    pub fn new(task: ID, worker: ID) -> Self {
        Self {
            id: ID::new(),
            task,
            worker,
            started_at: Utc::now(),
        }
    }
}

impl DBTable for Task {
    fn id(&self) -> ID {
        self.id
    }

    fn table_name() -> &'static str {
        "tasks"
    }

    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>> {
        let inputs: serde_json::Value = row
            .try_get("inputs")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let outputs: serde_json::Value = row
            .try_get("outputs")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let state: serde_json::Value = row
            .try_get("state")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(ExistingRow::from_existing(Self {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            job: row
                .try_get("job_id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            function_name: row
                .try_get("function_name")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            inputs: serde_json::from_value(inputs)
                .map_err(|e| StorageError::Other(e.to_string()))?,
            outputs: serde_json::from_value(outputs)
                .map_err(|e| StorageError::Other(e.to_string()))?,
            state: serde_json::from_value(state)
                .map_err(|e| StorageError::Other(e.to_string()))?,
            retries: row
                .try_get("retries")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            max_retries: row
                .try_get("max_retries")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            last_error: row
                .try_get("last_error")
                .map_err(|e| StorageError::Other(e.to_string()))?,
        }))
    }

    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>> {
        let inputs = serde_json::to_value(&self.inputs)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let outputs = serde_json::to_value(&self.outputs)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let state =
            serde_json::to_value(self.state).map_err(|e| StorageError::Other(e.to_string()))?;

        let c: Vec<(&str, Box<dyn ToSqlObject>)> = vec![
            col("id", self.id),
            col("job_id", self.job),
            col("function_name", self.function_name.clone()),
            col("inputs", inputs),
            col("outputs", outputs),
            col("state", state),
            col("retries", self.retries),
            col("max_retries", self.max_retries),
            col("last_error", self.last_error.clone()),
        ];

        Ok(c.into_iter().collect())
    }
}

impl DBTable for TaskInstance {
    fn id(&self) -> ID {
        self.id
    }

    fn table_name() -> &'static str {
        "task_instances"
    }

    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>> {
        Ok(ExistingRow::from_existing(Self {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            task: row
                .try_get("task_id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            worker: row
                .try_get("worker_id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| StorageError::Other(e.to_string()))?,
        }))
    }

    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>> {
        let c: Vec<(&str, Box<dyn ToSqlObject>)> = vec![
            col("id", self.id),
            col("task_id", self.task),
            col("worker_id", self.worker),
            col("started_at", self.started_at),
        ];

        Ok(c.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_inputs_always_resolve() {
        let mut task = Task::new("sum");
        task.add_input(TaskInput::literal(&2i64).unwrap());
        task.add_input(TaskInput::literal(&3i64).unwrap());

        assert!(task.inputs_resolved(|_, _| false));
    }

    #[test]
    fn edge_inputs_resolve_through_upstream() {
        let upstream = ID::new();
        let mut task = Task::new("sqrt");
        task.add_input(TaskInput::OutputRef {
            task: upstream,
            index: 0,
            type_tag: "int".to_owned(),
        });

        assert!(!task.inputs_resolved(|_, _| false));
        assert!(task.inputs_resolved(|id, index| id == upstream && index == 0));
    }

    #[test]
    fn input_serde_round_trip() {
        let input = TaskInput::literal(&12i64).unwrap();
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "value");
        let back: TaskInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn output_tags() {
        assert_eq!(TaskOutput::declared::<i64>().type_tag(), "int");
        assert_eq!(TaskOutput::Data { id: ID::new() }.type_tag(), "data");
        assert!(!TaskOutput::declared::<i64>().is_written());
    }
}
