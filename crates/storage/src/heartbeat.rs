// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time::Duration};

use common::StopFlag;
use dal::ID;

use crate::MetadataStorage;

/// Periodically rewrites this driver's heartbeat until a stop is requested.
///
/// Failures are tolerated up to the configured streak; past that the loop
/// requests a process-wide stop, since a component that cannot prove it is
/// alive must not keep holding tasks.
pub async fn heartbeat_loop<S: MetadataStorage + ?Sized>(store: Arc<S>, driver_id: ID) {
    let period = Duration::from_secs(config::settings().heartbeat.period_secs);
    let fail_streak_limit = config::settings().storage.fail_streak_limit;

    let mut fail_count = 0usize;
    while !StopFlag::is_stop_requested() {
        tokio::time::sleep(period).await;
        tracing::debug!("Updating heartbeat");

        match store.update_heartbeat(driver_id).await {
            Ok(()) => fail_count = 0,
            Err(e) => {
                tracing::error!("Failed to update heartbeat: {e}");
                fail_count += 1;
            }
        }

        if fail_count + 1 >= fail_streak_limit {
            tracing::error!("Heartbeat failed {fail_count} times in a row, requesting stop");
            StopFlag::request_stop();
            break;
        }
    }
}

/// Liveness threshold derived from the configured heartbeat period.
pub fn liveness_threshold() -> chrono::Duration {
    let cfg = &config::settings().heartbeat;
    chrono::Duration::seconds((cfg.period_secs * cfg.liveness_factor) as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use models::{Driver, DriverKind};

    use crate::{mem::MemoryStorage, MetadataStorage};

    #[tokio::test]
    async fn repeated_heartbeat_is_idempotent_modulo_timestamp() {
        let store = Arc::new(MemoryStorage::new());
        let id = dal::ID::new();
        let driver = Driver::new(id, DriverKind::Worker, Some("127.0.0.1:8001".into()));
        store.add_driver(&driver).await.unwrap();

        store.update_heartbeat(id).await.unwrap();
        let first = store.get_driver(id).await.unwrap();

        store.update_heartbeat(id).await.unwrap();
        let second = store.get_driver(id).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, second.kind);
        assert_eq!(first.address, second.address);
        assert!(second.heartbeat >= first.heartbeat);
    }
}
