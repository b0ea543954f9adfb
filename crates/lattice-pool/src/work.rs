//! The per-submission work record: identity, user body, callback, options,
//! execution state, and the synchronization primitives a caller or a
//! cooperating body blocks on.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{WorkError, WorkOutcome};
use crate::id::WorkId;
use crate::options::WorkOptions;
use crate::sync::{CancellationToken, Gate};

/// A work's position in its lifecycle. Monotone except for the
/// `Waiting -> Running -> Waiting` cycle legal on requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped | Self::Cancelled)
    }
}

/// The value a work body produces, type-erased so the dispatcher core can
/// hold heterogeneous works in one registry. Typed convenience wrappers
/// downcast this at the edge of the crate.
pub type BoxedValue = Box<dyn Any + Send>;

/// What a body is handed so it can cooperate with pause/stop requests.
pub struct WorkControl<'a> {
    work: &'a Work,
    pool_pause_gate: &'a Gate,
    pool_cancel: &'a CancellationToken,
}

impl<'a> WorkControl<'a> {
    pub(crate) fn new(work: &'a Work, pool_pause_gate: &'a Gate, pool_cancel: &'a CancellationToken) -> Self {
        Self { work, pool_pause_gate, pool_cancel }
    }

    /// Block while the pool, or this work specifically, is paused.
    pub fn pause_if_requested(&self) {
        self.pool_pause_gate.wait();
        self.work.pause_gate.wait();
    }

    /// Non-throwing observation: has a stop been requested for this work or
    /// the whole pool?
    pub fn check_if_requested_stop(&self) -> bool {
        self.pool_cancel.is_cancelled() || self.work.should_stop.load(Ordering::Acquire)
    }

    /// Ergonomic wrapper: returns `Err(WorkError::StopRequested)` so a body
    /// can exit early with `?` instead of throwing. The worker boundary
    /// always converts this variant to status `Stopped`, never `Failed`.
    pub fn stop_if_requested(&self) -> Result<(), WorkError> {
        if self.check_if_requested_stop() {
            Err(WorkError::StopRequested)
        } else {
            Ok(())
        }
    }
}

/// A work body may run more than once (retries), so it borrows its
/// environment rather than consuming it.
pub type WorkBody = Box<dyn Fn(&WorkControl<'_>) -> Result<BoxedValue, WorkError> + Send + Sync>;
/// A callback runs exactly once, for the work's single final outcome.
pub type WorkCallback = Box<dyn FnOnce(WorkOutcome<BoxedValue>) + Send>;
/// A pool-wide callback invoked for any work that was not given its own.
pub type DefaultCallback = Arc<dyn Fn(&WorkId, WorkOutcome<BoxedValue>) + Send + Sync>;

/// The per-submission record. Shared between the pool registry and the
/// worker currently executing it, but only the owning worker mutates
/// runtime state once the work has been dispatched.
pub struct Work {
    pub id: WorkId,
    pub options: WorkOptions,
    body: WorkBody,
    callback: Mutex<Option<WorkCallback>>,
    state: Mutex<WorkState>,
    queue_time: Mutex<Option<Instant>>,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
    execute_count: AtomicU32,
    should_stop: AtomicBool,
    /// Outstanding prerequisite ids this work still waits on. Emptied one
    /// at a time as prerequisites reach a terminal state; the work becomes
    /// dispatch-eligible the instant this reaches empty.
    remaining_dependents: Mutex<HashSet<WorkId>>,
    /// Opens once the work reaches a terminal state; backs `Wait(id)`.
    wait_gate: Gate,
    /// Per-work pause latch; starts open. Closed by a per-work `Pause`,
    /// reopened by the matching `Resume`.
    pause_gate: Gate,
    /// CAS guard ensuring exactly one finalization (normal completion or a
    /// racing forced-timeout) emits `WorkEnd` and runs the callback.
    finalized: AtomicBool,
}

impl Work {
    pub fn new(id: WorkId, body: WorkBody, callback: Option<WorkCallback>, options: WorkOptions) -> Self {
        let remaining_dependents = options.dependents.iter().cloned().collect();
        Self {
            id,
            options,
            body,
            callback: Mutex::new(callback),
            state: Mutex::new(WorkState::Waiting),
            queue_time: Mutex::new(None),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
            execute_count: AtomicU32::new(0),
            should_stop: AtomicBool::new(false),
            remaining_dependents: Mutex::new(remaining_dependents),
            wait_gate: Gate::new(false),
            pause_gate: Gate::new(true),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> &WorkBody {
        &self.body
    }

    pub fn state(&self) -> WorkState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: WorkState) {
        *self.state.lock() = state;
    }

    /// Whether every prerequisite has already reached a terminal state.
    pub fn is_ready_to_dispatch(&self) -> bool {
        self.remaining_dependents.lock().is_empty()
    }

    pub fn has_dependents(&self) -> bool {
        !self.options.dependents.is_empty()
    }

    pub fn dependent_ids(&self) -> Vec<WorkId> {
        self.options.dependents.clone()
    }

    /// Remove `prerequisite` from this work's outstanding set. Returns
    /// `true` if the set just became empty (the work is now eligible to
    /// dispatch).
    pub fn resolve_dependency(&self, prerequisite: &WorkId) -> bool {
        let mut remaining = self.remaining_dependents.lock();
        remaining.remove(prerequisite);
        remaining.is_empty()
    }

    /// Records the instant this work was handed to a worker only once. A
    /// `RetryStrategy::Requeue` retry re-dispatches the same work through
    /// [`crate::pool::PoolCore::dispatch_to_worker`], which calls this again —
    /// without the guard, that second call would push `queue_time` past the
    /// already-fixed `start_time`, saturating `queue_duration` to zero.
    pub fn record_queue_time(&self) {
        let mut guard = self.queue_time.lock();
        if guard.is_none() {
            *guard = Some(Instant::now());
        }
    }

    /// Records the instant of first execution only; later retries and
    /// requeues do not push this forward, so `queue_duration` always
    /// measures the original wait.
    pub fn record_start_time_once(&self) {
        let mut guard = self.start_time.lock();
        if guard.is_none() {
            *guard = Some(Instant::now());
        }
    }

    pub fn record_end_time(&self) {
        *self.end_time.lock() = Some(Instant::now());
    }

    /// Time spent waiting before first execution began.
    pub fn queue_duration(&self) -> Duration {
        match (*self.queue_time.lock(), *self.start_time.lock()) {
            (Some(q), Some(s)) => s.saturating_duration_since(q),
            _ => Duration::ZERO,
        }
    }

    /// Wall-clock time from first start to final end, across every retry.
    pub fn execute_duration(&self) -> Duration {
        match (*self.start_time.lock(), *self.end_time.lock()) {
            (Some(s), Some(e)) => e.saturating_duration_since(s),
            _ => Duration::ZERO,
        }
    }

    pub fn execute_count(&self) -> u32 {
        self.execute_count.load(Ordering::Acquire)
    }

    pub fn increment_execute_count(&self) {
        self.execute_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Request a cooperative stop of this specific work.
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.pause_gate.close();
    }

    pub fn resume(&self) {
        self.pause_gate.open();
    }

    pub fn is_paused(&self) -> bool {
        !self.pause_gate.is_open()
    }

    pub fn take_callback(&self) -> Option<WorkCallback> {
        self.callback.lock().take()
    }

    /// Claim the right to finalize this work. Returns `true` for exactly
    /// one caller; a second caller (e.g. a timeout watcher racing the
    /// worker's own completion path) gets `false` and must not emit
    /// `WorkEnd` or run the callback.
    pub fn try_finalize(&self) -> bool {
        self.finalized.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Open the completion latch, releasing any `Wait(id)` callers.
    pub fn signal_done(&self) {
        self.wait_gate.open();
    }

    pub fn wait(&self) {
        self.wait_gate.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_gate.wait_timeout(timeout)
    }

    pub fn control<'a>(&'a self, pool_pause_gate: &'a Gate, pool_cancel: &'a CancellationToken) -> WorkControl<'a> {
        WorkControl::new(self, pool_pause_gate, pool_cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::WorkOptions;

    fn noop_body() -> WorkBody {
        Box::new(|_ctl: &WorkControl<'_>| Ok(Box::new(()) as BoxedValue))
    }

    #[test]
    fn new_work_starts_waiting_with_no_timestamps() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        assert_eq!(w.state(), WorkState::Waiting);
        assert_eq!(w.queue_duration(), Duration::ZERO);
        assert!(w.is_ready_to_dispatch());
    }

    #[test]
    fn dependents_gate_until_all_resolved() {
        let dep_a = WorkId::custom("a");
        let dep_b = WorkId::custom("b");
        let w = Work::new(
            WorkId::generate(),
            noop_body(),
            None,
            WorkOptions::new().with_dependents([dep_a.clone(), dep_b.clone()]),
        );
        assert!(!w.is_ready_to_dispatch());
        assert!(!w.resolve_dependency(&dep_a));
        assert!(!w.is_ready_to_dispatch());
        assert!(w.resolve_dependency(&dep_b));
        assert!(w.is_ready_to_dispatch());
    }

    #[test]
    fn wait_unblocks_after_signal_done() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        assert!(!w.wait_timeout(Duration::from_millis(10)));
        w.signal_done();
        w.wait();
    }

    #[test]
    fn per_work_pause_closes_and_reopens_gate() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        assert!(!w.is_paused());
        w.pause();
        assert!(w.is_paused());
        w.resume();
        assert!(!w.is_paused());
    }

    #[test]
    fn control_reports_stop_from_either_source() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        let pause_gate = Gate::new(true);
        let cancel = CancellationToken::new();
        assert!(!w.control(&pause_gate, &cancel).check_if_requested_stop());
        w.request_stop();
        assert!(w.control(&pause_gate, &cancel).check_if_requested_stop());

        let w2 = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        cancel.cancel();
        assert!(w2.control(&pause_gate, &cancel).check_if_requested_stop());
    }

    #[test]
    fn execute_count_increments() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        assert_eq!(w.execute_count(), 0);
        w.increment_execute_count();
        assert_eq!(w.execute_count(), 1);
    }

    #[test]
    fn only_one_caller_wins_finalize() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        assert!(w.try_finalize());
        assert!(!w.try_finalize());
    }

    #[test]
    fn requeue_does_not_reset_an_already_recorded_queue_time() {
        let w = Work::new(WorkId::generate(), noop_body(), None, WorkOptions::new());
        w.record_queue_time();
        std::thread::sleep(Duration::from_millis(20));
        // A `RetryStrategy::Requeue` retry re-dispatches through the same
        // call path, which calls this again; it must be a no-op the second
        // time.
        w.record_queue_time();
        w.record_start_time_once();
        assert!(w.queue_duration() >= Duration::from_millis(20));
    }

    #[test]
    fn body_is_reinvocable_for_retries() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let body: WorkBody = Box::new(move |_ctl| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(()) as BoxedValue)
        });
        let w = Work::new(WorkId::generate(), body, None, WorkOptions::new());
        let pause_gate = Gate::new(true);
        let cancel = CancellationToken::new();
        let control = w.control(&pause_gate, &cancel);
        (w.body())(&control).unwrap();
        (w.body())(&control).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
