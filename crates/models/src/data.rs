// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use dal::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_postgres::Row;

/// An opaque user byte blob with optional placement constraints.
///
/// At most one writer ever exists (the creating driver or producing task);
/// readers may be many. Non-persisted data dies with its owner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Data {
    pub id: ID,

    #[serde(with = "crate::codec::bytes_b64")]
    pub value: Vec<u8>,

    pub owner: DataOwner,

    /// Persisted data survives owner death and is always recoverable.
    pub persisted: bool,

    /// With `hard_locality`, the locality list is exclusive; otherwise it is
    /// advisory.
    pub hard_locality: bool,

    /// Host addresses where this value is resident. Empty means anywhere.
    pub locality: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataOwner {
    Driver(ID),
    Task(ID),
}

impl Data {
    pub fn new(value: Vec<u8>, owner: DataOwner) -> Self {
        Self {
            id: ID::new(),
            value,
            owner,
            persisted: false,
            hard_locality: false,
            locality: Vec::new(),
        }
    }

    pub fn set_persisted(&mut self, persisted: bool) {
        self.persisted = persisted;
    }

    pub fn set_hard_locality(&mut self, hard: bool) {
        self.hard_locality = hard;
    }

    pub fn set_locality(&mut self, locality: Vec<String>) {
        self.locality = locality;
    }

    /// Whether a worker at `address` satisfies this data's placement.
    /// An empty locality list places no restriction at all.
    pub fn locality_allows(&self, address: &str) -> bool {
        self.locality.is_empty() || self.locality.iter().any(|host| host == address)
    }
}

impl DBTable for Data {
    fn id(&self) -> ID {
        self.id
    }

    fn table_name() -> &'static str {
        "data"
    }

    fn from_row(row: Row) -> StorageResult<ExistingRow<Self>> {
        let owner: serde_json::Value = row
            .try_get("owner")
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let locality: serde_json::Value = row
            .try_get("locality")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(ExistingRow::from_existing(Self {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            value: row
                .try_get("value")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            owner: serde_json::from_value(owner)
                .map_err(|e| StorageError::Other(e.to_string()))?,
            persisted: row
                .try_get("persisted")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            hard_locality: row
                .try_get("hard_locality")
                .map_err(|e| StorageError::Other(e.to_string()))?,
            locality: serde_json::from_value(locality)
                .map_err(|e| StorageError::Other(e.to_string()))?,
        }))
    }

    fn to_rowlike(&self) -> StorageResult<HashMap<&str, Box<dyn ToSqlObject>>> {
        let owner =
            serde_json::to_value(self.owner).map_err(|e| StorageError::Other(e.to_string()))?;
        let locality = serde_json::to_value(&self.locality)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let c: Vec<(&str, Box<dyn ToSqlObject>)> = vec![
            col("id", self.id),
            col("value", self.value.clone()),
            col("owner", owner),
            col("persisted", self.persisted),
            col("hard_locality", self.hard_locality),
            col("locality", locality),
        ];

        Ok(c.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_locality_allows_any_address() {
        let data = Data::new(b"v".to_vec(), DataOwner::Driver(ID::new()));
        assert!(data.locality_allows(""));
        assert!(data.locality_allows("10.0.0.1"));
    }

    #[test]
    fn locality_list_is_exact_match() {
        let mut data = Data::new(b"v".to_vec(), DataOwner::Driver(ID::new()));
        data.set_locality(vec!["127.0.0.1".to_owned()]);
        assert!(data.locality_allows("127.0.0.1"));
        assert!(!data.locality_allows(""));
        assert!(!data.locality_allows("10.0.0.1"));
    }
}
