// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use uuid::Uuid;

/// Picks the log sink for a daemon process.
///
/// `SPIDER_LOG_FILE` names the exact file to append to; otherwise
/// `SPIDER_LOG_DIR` selects a directory that receives one file per process,
/// named `<component>_<id>.log`. With neither set, logs go to stderr.
fn log_sink(component: &str, id: Uuid) -> Option<PathBuf> {
    if let Ok(file) = std::env::var("SPIDER_LOG_FILE") {
        return Some(PathBuf::from(file));
    }

    if let Ok(dir) = std::env::var("SPIDER_LOG_DIR") {
        return Some(PathBuf::from(dir).join(format!("{component}_{id}.log")));
    }

    None
}

/// Installs the global tracing subscriber for a spider process.
///
/// Mirrors the usual daemon startup: a `fmt` subscriber, max level from the
/// settings file, writing either to the env-selected sink or to stderr. If a
/// log file cannot be created we fall back to stderr rather than refusing to
/// start.
pub fn setup(component: &str, id: Uuid) {
    let max_level = config::settings().logging.max_level;

    let subscriber = tracing_subscriber::fmt::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::from(max_level))
        .with_target(false);

    let file = log_sink(component, id).and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
    });

    let installed = match file {
        Some(file) => {
            let file = std::sync::Mutex::new(file);
            tracing::subscriber::set_global_default(
                subscriber.with_writer(file).with_ansi(false).finish(),
            )
        }
        None => tracing::subscriber::set_global_default(
            subscriber.with_writer(std::io::stderr).finish(),
        ),
    };

    if installed.is_err() {
        // A second install attempt (tests, embedded use) is not fatal.
        tracing::debug!("tracing subscriber was already installed");
    }
}
