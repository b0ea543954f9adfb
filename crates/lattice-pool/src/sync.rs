//! Small blocking synchronization primitives shared by works, workers, and
//! the pool: a manual-reset gate and a cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A manual-reset latch: callers block in [`Gate::wait`] while the gate is
/// closed, and are released (all at once) when it opens. Unlike a
/// single-shot wakeup, a `Gate` can be closed again and reused — this
/// backs both the pool-wide pause latch and a work's one-shot completion
/// latch (which simply never closes once opened).
pub struct Gate {
    open: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self { open: AtomicBool::new(open), condvar: Condvar::new(), mutex: Mutex::new(()) }
    }

    /// Open the gate, releasing every waiter.
    pub fn open(&self) {
        let _guard = self.mutex.lock();
        self.open.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Close the gate; subsequent `wait` calls block until the next `open`.
    pub fn close(&self) {
        let _guard = self.mutex.lock();
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Block until the gate is open.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !self.open.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the gate is open or `timeout` elapses. Returns whether
    /// the gate was observed open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.mutex.lock();
        if self.open.load(Ordering::Acquire) {
            return true;
        }
        let result = self.condvar.wait_for(&mut guard, timeout);
        self.open.load(Ordering::Acquire) || !result.timed_out()
    }
}

/// A pool-wide cooperative cancellation signal. Once cancelled, a token
/// stays cancelled for the remainder of the pool's `Running` epoch; a fresh
/// token is installed on the next `Running` transition rather than resetting
/// this one in place, so works that captured the old token at dispatch time
/// keep seeing it as cancelled even if a new epoch starts concurrently.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn gate_releases_waiters_on_open() {
        let gate = Arc::new(Gate::new(false));
        let g = gate.clone();
        let handle = thread::spawn(move || {
            g.wait();
        });
        thread::sleep(Duration::from_millis(20));
        gate.open();
        handle.join().unwrap();
    }

    #[test]
    fn gate_wait_timeout_reports_closed() {
        let gate = Gate::new(false);
        assert!(!gate.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn gate_can_be_closed_and_reopened() {
        let gate = Gate::new(true);
        assert!(gate.is_open());
        gate.close();
        assert!(!gate.is_open());
        gate.open();
        assert!(gate.is_open());
    }

    #[test]
    fn separate_tokens_do_not_share_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        let c = CancellationToken::new();
        a.cancel();
        assert!(b.is_cancelled());
        assert!(!c.is_cancelled());
    }
}
