// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicI32, Ordering};

static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Registry for the pid of the currently running task executor.
///
/// The task loop stores the pid right after spawning the child and clears it
/// after reaping; the SIGTERM watcher reads it to forward the signal. Zero
/// means no child is alive.
pub struct ChildPid;

impl ChildPid {
    pub fn set_pid(pid: i32) {
        CHILD_PID.store(pid, Ordering::SeqCst);
    }

    pub fn clear() {
        CHILD_PID.store(0, Ordering::SeqCst);
    }

    pub fn get_pid() -> i32 {
        CHILD_PID.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::ChildPid;

    #[test]
    fn set_and_clear() {
        ChildPid::set_pid(4242);
        assert_eq!(ChildPid::get_pid(), 4242);

        ChildPid::clear();
        assert_eq!(ChildPid::get_pid(), 0);
    }
}
