// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT
//! # Sample config
//! ```yaml
//! heartbeat:
//!   period_secs: 1
//!   liveness_factor: 5
//! worker:
//!   poll_interval_ms: 100
//!   task_finish_retries: 5
//! storage:
//!   fail_streak_limit: 5
//! logging:
//!   max_level: "INFO"
//! ```

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SpiderConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeat writes.
    #[serde(default = "default_heartbeat_period")]
    pub period_secs: u64,

    /// A driver whose heartbeat is older than `liveness_factor * period`
    /// is considered dead.
    #[serde(default = "default_liveness_factor")]
    pub liveness_factor: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period_secs: default_heartbeat_period(),
            liveness_factor: default_liveness_factor(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Milliseconds between scheduler polls when no task is available.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Bounded retry count for committing task results on deadlock.
    #[serde(default = "default_task_finish_retries")]
    pub task_finish_retries: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            task_finish_retries: default_task_finish_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Consecutive connection failures tolerated before the component
    /// requests its own shutdown.
    #[serde(default = "default_fail_streak_limit")]
    pub fail_streak_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fail_streak_limit: default_fail_streak_limit(),
        }
    }
}

fn default_heartbeat_period() -> u64 {
    1
}

fn default_liveness_factor() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    100
}

fn default_task_finish_retries() -> usize {
    5
}

fn default_fail_streak_limit() -> usize {
    5
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LoggingLevel {
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
    OFF,
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.as_str() {
            "ERROR" => Self::ERROR,
            "WARN" => Self::WARN,
            "INFO" => Self::INFO,
            "DEBUG" => Self::DEBUG,
            "TRACE" => Self::TRACE,
            "OFF" => Self::OFF,
            other => Err(serde::de::Error::custom(format!(
                "Bad logging level specifier {other}"
            )))?,
        })
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::ERROR => LevelFilter::ERROR,
            LoggingLevel::WARN => LevelFilter::WARN,
            LoggingLevel::INFO => LevelFilter::INFO,
            LoggingLevel::DEBUG => LevelFilter::DEBUG,
            LoggingLevel::TRACE => LevelFilter::TRACE,
            LoggingLevel::OFF => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub max_level: LoggingLevel,
}

static CONFIG: once_cell::sync::Lazy<SpiderConfig> = once_cell::sync::Lazy::new(|| {
    let path =
        std::env::var("SPIDER_CONFIG").unwrap_or_else(|_| "spider.yaml".to_owned());

    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_yaml::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("config file {path} is invalid ({e}), using defaults");
                SpiderConfig::default()
            }
        },
        // Daemons are configured primarily by CLI flags; the file is optional.
        Err(_) => SpiderConfig::default(),
    }
});

pub fn settings() -> &'static SpiderConfig {
    &CONFIG
}
