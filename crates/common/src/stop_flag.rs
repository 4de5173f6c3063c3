// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);

/// Process-wide cooperative shutdown flag shared between the signal watcher
/// and the worker/scheduler loops.
///
/// Only relaxed atomic operations are performed, so every method here is safe
/// to call from a signal context.
pub struct StopFlag;

impl StopFlag {
    pub fn request_stop() {
        STOP.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested() -> bool {
        STOP.load(Ordering::SeqCst)
    }

    /// Clears the flag. Intended for tests; a daemon never un-stops itself.
    pub fn reset() {
        STOP.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::StopFlag;

    #[test]
    fn request_stop_is_visible() {
        StopFlag::reset();
        assert!(!StopFlag::is_stop_requested());

        StopFlag::request_stop();
        assert!(StopFlag::is_stop_requested());

        StopFlag::reset();
        assert!(!StopFlag::is_stop_requested());
    }
}
