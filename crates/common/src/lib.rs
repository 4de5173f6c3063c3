// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

pub mod child_pid;
pub mod logging;
pub mod stop_flag;

pub use child_pid::ChildPid;
pub use stop_flag::StopFlag;

pub mod prelude {
    pub use anyhow;
    pub use chrono;
    pub use config;
    pub use itertools;
    pub use once_cell;
    pub use parking_lot;
    pub use serde_json;
    pub use thiserror;
    pub use tokio;
    pub use tracing;
    pub use uuid;

    pub use serde::{Deserialize, Serialize};
}
