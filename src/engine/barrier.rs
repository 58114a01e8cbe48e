// ZUS CORE — ENGINE: WAIT-FOR-ZERO BARRIER
// Countdown synchronizer for worker-grid startup: the mount controller arms
// it with the expected worker count and blocks until every worker has either
// come online or parked an init error. Single producer arms, many releasers
// decrement, a single waiter blocks.

use std::sync::{Condvar, Mutex};

pub struct WaitTilZero {
    count: Mutex<u32>,
    cond: Condvar,
}

impl WaitTilZero {
    pub fn new() -> WaitTilZero {
        WaitTilZero { count: Mutex::new(0), cond: Condvar::new() }
    }

    /// Set the countdown. Called before any releaser can run.
    pub fn arm(&self, n: u32) {
        let mut count = self.count.lock().unwrap();
        *count = n;
    }

    /// Drop the count by one; wakes the waiter when it reaches zero.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}

impl Default for WaitTilZero {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
