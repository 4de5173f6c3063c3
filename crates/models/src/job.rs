// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use dal::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Row;

/// One submission of a task graph. Owns its tasks: removing the job removes
/// tasks, instances and task-produced data.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub id: FKey<Job>,

    pub client: ID,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: ID, client: ID) -> Self {
        Self {
            id: FKey::from_id(id),
            client,
            created_at: Utc::now(),
        }
    }
}

/// Observable status of a job, derived from its task states.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl DBTable for Job {
    fn id(&self) -> ID {
        self.id.into_id()
    }

    fn table_name() -> &'static str {
        "jobs"
    }

    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>> {
        Ok(ExistingRow::from_existing(Self {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            client: row
                .try_get("client_id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StorageError::Other(e.to_string()))?,
        }))
    }

    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>> {
        let c: Vec<(&str, Box<dyn ToSqlObject>)> = vec![
            col("id", self.id),
            col("client_id", self.client),
            col("created_at", self.created_at),
        ];

        Ok(c.into_iter().collect())
    }
}
