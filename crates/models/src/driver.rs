// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use dal::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Row;

/// A registered cluster participant: a client, a worker, or a scheduler.
///
/// The row doubles as the liveness record; `heartbeat` is rewritten every
/// period and compared against the liveness threshold by the reaper.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Driver {
    pub id: FKey<Driver>,

    pub kind: DriverKind,
    /// `host:port` for workers and schedulers; clients carry no address.
    pub address: Option<String>,
    pub heartbeat: DateTime<Utc>,
}

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Client,
    Worker,
    Scheduler,
}

impl Driver {
    pub fn new(id: ID, kind: DriverKind, address: Option<String>) -> Self {
        Self {
            id: FKey::from_id(id),
            kind,
            address,
            heartbeat: Utc::now(),
        }
    }

    /// Whether this driver's heartbeat is older than the liveness threshold.
    pub fn is_dead(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.heartbeat > threshold
    }
}

impl DBTable for Driver {
    fn id(&self) -> ID {
        self.id.into_id()
    }

    fn table_name() -> &'static str {
        "drivers"
    }

    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>> {
        let kind: serde_json::Value = row
            .try_get("kind")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(ExistingRow::from_existing(Self {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            kind: serde_json::from_value(kind).map_err(|e| StorageError::Other(e.to_string()))?,
            address: row
                .try_get("address")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            heartbeat: row
                .try_get("heartbeat")
                .map_err(|e| StorageError::Other(e.to_string()))?,
        }))
    }

    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>> {
        let kind =
            serde_json::to_value(self.kind).map_err(|e| StorageError::Other(e.to_string()))?;

        let c: Vec<(&str, Box<dyn ToSqlObject>)> = vec![
            col("id", self.id),
            col("kind", kind),
            col("address", self.address.clone()),
            col("heartbeat", self.heartbeat),
        ];

        Ok(c.into_iter().collect())
    }
}
