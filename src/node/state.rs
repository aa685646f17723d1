//! State cell: a numeric state slot with condition-wait.
//!
//! The node lifecycle machine and the client connection machine are both
//! plain `u32`-repr enums layered on this one primitive. Every state is
//! just a number at this layer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;

/// Deadline reached before the awaited state value appeared.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("timed out waiting for state {expected}")]
pub(crate) struct AwaitTimeout {
    /// State value the caller was waiting for.
    pub expected: u32,
}

/// Numeric state slot with mutual exclusion and condition-wait.
#[derive(Debug)]
pub(crate) struct StateCell {
    value: AtomicU32,
    guard: Mutex<()>,
    cond: Condvar,
}

impl StateCell {
    /// Create a cell holding `initial`.
    pub fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
            guard: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Latest visible value. Lock-free.
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Store a new value and wake all waiters.
    pub fn set(&self, value: u32) {
        let _guard = self.guard.lock().expect("state mutex poisoned");
        self.value.store(value, Ordering::Release);
        self.cond.notify_all();
    }

    /// Store `to` and wake all waiters, but only if the current value is
    /// `from`. Returns whether the transition happened.
    pub fn transition(&self, from: u32, to: u32) -> bool {
        let _guard = self.guard.lock().expect("state mutex poisoned");
        if self.value.load(Ordering::Acquire) != from {
            return false;
        }
        self.value.store(to, Ordering::Release);
        self.cond.notify_all();
        true
    }

    /// Wait until the value equals `expected` or the deadline passes.
    ///
    /// Without a deadline the wait is unbounded. Spurious wakeups are
    /// tolerated; a deadline expiry leaves the value untouched.
    pub fn await_value(
        &self,
        expected: u32,
        deadline: Option<Instant>,
    ) -> Result<(), AwaitTimeout> {
        let mut guard = self.guard.lock().expect("state mutex poisoned");
        loop {
            if self.value.load(Ordering::Acquire) == expected {
                return Ok(());
            }
            match deadline {
                None => {
                    guard = self.cond.wait(guard).expect("state mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(AwaitTimeout { expected });
                    }
                    let (reacquired, _) = self
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .expect("state mutex poisoned");
                    guard = reacquired;
                }
            }
        }
    }
}
