// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::future::Future;

use tokio_postgres::error::SqlState;

pub type StorageResult<T> = Result<T, StorageError>;

/// Error taxonomy for every storage-facing operation. Values are returned,
/// never thrown across a component boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage connection failed: {0}")]
    Connection(String),

    /// Deadlock-class failure. The only kind that is locally retriable.
    #[error("storage deadlock: {0}")]
    Deadlock(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A guarded state transition found the row in a different state than
    /// required, e.g. a scheduler losing a dispatch race or an orphaned
    /// task instance reporting a result.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, StorageError::Deadlock(_))
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.code() {
            Some(&SqlState::T_R_DEADLOCK_DETECTED) | Some(&SqlState::T_R_SERIALIZATION_FAILURE) => {
                StorageError::Deadlock(e.to_string())
            }
            Some(code) if code.code().starts_with("23") => {
                StorageError::ConstraintViolation(e.to_string())
            }
            Some(&SqlState::CONNECTION_EXCEPTION)
            | Some(&SqlState::CONNECTION_FAILURE)
            | Some(&SqlState::CONNECTION_DOES_NOT_EXIST) => {
                StorageError::Connection(e.to_string())
            }
            _ => StorageError::Other(e.to_string()),
        }
    }
}

/// Runs `op` until it returns anything other than a deadlock-class error,
/// bounded by `retries` attempts. Every other error is surfaced immediately.
pub async fn retry_on_deadlock<T, F, Fut>(retries: usize, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let attempts = retries.max(1);
    let mut last = StorageError::Other("retry loop never ran".to_owned());

    for attempt in 0..attempts {
        match op().await {
            Err(e) if e.is_deadlock() => {
                tracing::debug!("deadlock on attempt {attempt}, retrying: {e}");
                last = e;
            }
            other => return other,
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_deadlocks_until_success() {
        let mut calls = 0;
        let res = retry_on_deadlock(5, || {
            calls += 1;
            let out = if calls < 3 {
                Err(StorageError::Deadlock("contended".into()))
            } else {
                Ok(calls)
            };
            async move { out }
        })
        .await;

        assert_eq!(res.unwrap(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let mut calls = 0;
        let res: StorageResult<()> = retry_on_deadlock(5, || {
            calls += 1;
            async { Err(StorageError::KeyNotFound("gone".into())) }
        })
        .await;

        assert!(matches!(res, Err(StorageError::KeyNotFound(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn gives_up_after_bound() {
        let mut calls = 0;
        let res: StorageResult<()> = retry_on_deadlock(5, || {
            calls += 1;
            async { Err(StorageError::Deadlock("contended".into())) }
        })
        .await;

        assert!(matches!(res, Err(StorageError::Deadlock(_))));
        assert_eq!(calls, 5);
    }
}
