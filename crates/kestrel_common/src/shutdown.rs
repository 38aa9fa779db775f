//! Interruptible shutdown signal for background runners.
//!
//! Runners loop on `wait_timeout(interval)` instead of `thread::sleep`, so a
//! stop request wakes them immediately rather than after a full interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        let _guard = self.inner.mutex.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on shutdown.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_shutdown() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
