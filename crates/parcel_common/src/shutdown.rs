//! Cooperative stop signal for the background threads (expiration sweeper,
//! admission sampler).
//!
//! A worker loops on `wait_timeout(period)`; a call to `shutdown()` from any
//! other thread wakes every waiter at once, so stop latency does not depend
//! on the tick period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cloneable handle; all clones observe the same stop request.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

struct SignalState {
    stopped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalState {
                stopped: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Request stop. Idempotent.
    pub fn shutdown(&self) {
        // Take the lock so a waiter cannot miss the notification between its
        // flag check and its wait.
        let _guard = self.inner.lock.lock();
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Block for up to `period`. Returns `true` when stop was requested,
    /// either before the call or while waiting.
    pub fn wait_timeout(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut guard = self.inner.lock.lock();
        while !self.is_shutdown() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_signal_is_not_stopped() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_shutdown_is_shared_across_clones() {
        let a = ShutdownSignal::new();
        let b = a.clone();
        a.shutdown();
        a.shutdown();
        assert!(b.is_shutdown());
    }

    #[test]
    fn test_wait_returns_at_once_after_stop() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        let start = Instant::now();
        assert!(sig.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_stop_wakes_a_long_wait() {
        let sig = ShutdownSignal::new();
        let waiter = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (waiter.wait_timeout(Duration::from_secs(300)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(2), "woke after {elapsed:?}");
    }

    #[test]
    fn test_wait_times_out_without_stop() {
        let sig = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
