//! Stop signals
//!
//! A set-once flag shared by a tunnel's acceptance loop and all of its
//! connection threads. Checking it never blocks; `wait_timeout` lets idle
//! workers (keepalive) sleep on it instead of polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    set: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cloneable termination signal
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter. Later calls are no-ops.
    pub fn set(&self) {
        if self.inner.set.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Block until the signal is set or `timeout` elapses; returns `is_set()`
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_set() {
            return true;
        }
        self.inner.cond.wait_for(&mut guard, timeout);
        self.is_set()
    }
}
