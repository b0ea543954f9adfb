//! A long-lived executor owning one OS thread, a private priority-ordered
//! queue of pending works, and the {Idle, Running, ToBeDisposed} state
//! machine from the component design.
//!
//! A worker never strongly references its owning pool — it holds a `Weak`
//! back-reference (the [`PoolBackref`] trait) so the pool/worker pair never
//! forms a reference cycle; the pool is what keeps a worker alive.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{WorkError, WorkOutcome};
use crate::events::{PoolEvent, WorkStatus};
use crate::id::WorkId;
use crate::logging::targets;
use crate::options::{DestroyThreadOption, RetryStrategy, TimeoutOption};
use crate::priority::{PriorityCollection, PriorityKind};
use crate::sync::{CancellationToken, Gate};
use crate::work::{BoxedValue, Work};

/// How often the run loop wakes even with no signal, to observe `kill_flag`
/// and idle keep-alive expiry without a dedicated timer thread per worker.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

use crate::id::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    ToBeDisposed,
}

/// The pool-side operations a worker needs without holding a strong
/// reference back to the pool. Implemented by `crate::pool::PoolCore`.
pub(crate) trait PoolBackref: Send + Sync {
    fn pause_gate(&self) -> &Gate;
    fn cancel_token(&self) -> CancellationToken;
    fn events(&self) -> &crate::events::EventBus;
    fn default_callback(&self) -> Option<crate::work::DefaultCallback>;
    fn default_work_timeout(&self) -> Option<TimeoutOption>;
    fn destroy_thread_option(&self) -> DestroyThreadOption;
    fn alive_worker_count(&self) -> usize;
    fn is_stopping(&self) -> bool;
    fn record_completion(&self, queue_time: Duration, execute_time: Duration);
    /// A work reached a terminal state and has already had its callback
    /// invoked. Removes it from shared registries, releases dependents, and
    /// runs the idle sweep check.
    fn on_work_terminal(&self, work: &Arc<Work>, status: WorkStatus);
    fn mark_failed(&self, id: &WorkId);
    /// `RetryStrategy::Requeue`: re-submit as if freshly queued.
    fn requeue(&self, work: Arc<Work>);
    /// Return this now-idle worker to the idle pool.
    fn return_idle(&self, worker: Arc<Worker>);
    /// A worker is permanently gone (clean shutdown or forced abandonment).
    fn retire_worker(&self, worker_id: WorkerId);
    /// A worker was abandoned mid-execution by a forced timeout; the pool
    /// should replace its capacity with a fresh worker if it is not
    /// stopping.
    fn replace_abandoned_worker(&self, worker_id: WorkerId);
}

pub struct Worker {
    pub id: WorkerId,
    pool: Weak<dyn PoolBackref>,
    pending: PriorityCollection<Arc<Work>>,
    state: Mutex<WorkerState>,
    /// CAS claim flag: `false` (unlocked) while available for the
    /// dispatcher to hand this worker a work, `true` while a dispatch
    /// decision involving this worker is in flight.
    getted_lock: AtomicBool,
    long_running: AtomicBool,
    current_work: Mutex<Option<Arc<Work>>>,
    kill_flag: AtomicBool,
    run_tx: crossbeam_channel::Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a new worker thread bound to `pool`.
    pub(crate) fn spawn(pool: Weak<dyn PoolBackref>, priority_kind: PriorityKind) -> Arc<Self> {
        let (run_tx, run_rx) = crossbeam_channel::unbounded();
        let worker = Arc::new(Self {
            id: WorkerId::generate(),
            pool,
            pending: PriorityCollection::new(priority_kind),
            state: Mutex::new(WorkerState::Idle),
            getted_lock: AtomicBool::new(false),
            long_running: AtomicBool::new(false),
            current_work: Mutex::new(None),
            kill_flag: AtomicBool::new(false),
            run_tx,
            thread: Mutex::new(None),
        });

        let run_loop_worker = worker.clone();
        let handle = thread::Builder::new()
            .name(format!("lattice-pool-{}", worker.id))
            .spawn(move || run_loop_worker.run(run_rx))
            .expect("failed to spawn worker thread");
        *worker.thread.lock() = Some(handle);
        worker
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    pub fn is_long_running(&self) -> bool {
        self.long_running.load(Ordering::Acquire)
    }

    pub fn set_long_running(&self, value: bool) {
        self.long_running.store(value, Ordering::Release);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Try to claim this worker for a dispatch decision. Returns `true` on
    /// success; the caller must call [`Worker::release_claim`] once it has
    /// either pushed work onto this worker or abandoned the attempt.
    pub fn try_claim(&self) -> bool {
        self.getted_lock.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn release_claim(&self) {
        self.getted_lock.store(false, Ordering::Release);
    }

    /// Push a work onto this worker's private collection and wake it if it
    /// was idle.
    pub fn assign(&self, work: Arc<Work>) {
        let priority = work.options.priority;
        self.pending.set(work, priority);
        let _ = self.run_tx.send(());
    }

    pub fn request_kill(&self) {
        self.kill_flag.store(true, Ordering::Release);
        let _ = self.run_tx.send(());
    }

    /// Forward a cooperative stop to the work this worker is currently
    /// executing, if any.
    pub fn stop_current_work(&self) {
        if let Some(work) = self.current_work.lock().as_ref() {
            work.request_stop();
        }
    }

    pub fn pause_current_work(&self) {
        if let Some(work) = self.current_work.lock().as_ref() {
            work.pause();
        }
    }

    pub fn resume_current_work(&self) {
        if let Some(work) = self.current_work.lock().as_ref() {
            work.resume();
        }
    }

    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>, run_rx: crossbeam_channel::Receiver<()>) {
        let mut idle_since: Option<Instant> = None;
        let mut registered_idle = false;

        loop {
            let _ = run_rx.recv_timeout(POLL_INTERVAL);
            if self.kill_flag.load(Ordering::Acquire) {
                break;
            }

            while let Some(work) = self.pending.get() {
                if work.state().is_terminal() {
                    // Cancelled before this worker reached it in the queue.
                    continue;
                }
                idle_since = None;
                registered_idle = false;
                self.set_state(WorkerState::Running);
                self.execute(&work);
                if self.kill_flag.load(Ordering::Acquire) {
                    break;
                }
            }
            if self.kill_flag.load(Ordering::Acquire) {
                break;
            }

            let Some(pool) = self.pool.upgrade() else { break };

            if !registered_idle {
                self.set_state(WorkerState::Idle);
                idle_since = Some(Instant::now());
                registered_idle = true;
                pool.return_idle(self.clone());
            }

            if self.should_self_destruct(pool.as_ref(), idle_since) {
                break;
            }
        }

        self.set_state(WorkerState::ToBeDisposed);
        if let Some(pool) = self.pool.upgrade() {
            pool.retire_worker(self.id);
        }
    }

    fn should_self_destruct(&self, pool: &dyn PoolBackref, idle_since: Option<Instant>) -> bool {
        if !pool.is_stopping() || self.is_long_running() {
            return false;
        }
        let destroy = pool.destroy_thread_option();
        if pool.alive_worker_count() <= destroy.min_threads {
            return false;
        }
        matches!(idle_since, Some(t) if t.elapsed() >= destroy.keep_alive)
    }

    /// Execute steps 3-6 of the worker lifecycle for a single dequeued
    /// work, including its retry loop.
    fn execute(&self, work: &Arc<Work>) {
        let Some(pool) = self.pool.upgrade() else { return };
        let _span = tracing::info_span!(target: targets::WORKER, "work", id = %work.id).entered();

        *self.current_work.lock() = Some(work.clone());
        work.set_state(crate::work::WorkState::Running);
        work.record_start_time_once();
        pool.events().emit(PoolEvent::WorkStart(work.id.clone()));

        let timeout = work.options.timeout.or_else(|| pool.default_work_timeout());
        let timeout_handle = timeout.map(|t| self.spawn_timeout_watcher(work.clone(), t, &pool));

        let outcome = self.run_with_retries(work, pool.as_ref());

        if let Some(handle) = timeout_handle {
            handle.cancel();
        }

        *self.current_work.lock() = None;

        let Some(outcome) = outcome else {
            // Requeued: a future dispatch of the same id will finalize it.
            return;
        };

        if !work.try_finalize() {
            // A racing forced-timeout watcher already finalized this work.
            return;
        }
        finalize(work, outcome, pool.as_ref());
    }

    /// Runs the body, applying the work's retry policy in place for
    /// `Immediate` or handing off to the dispatcher for `Requeue`.
    /// Returns `None` when the work was requeued (no outcome to finalize
    /// from this call).
    fn run_with_retries(&self, work: &Arc<Work>, pool: &dyn PoolBackref) -> Option<WorkOutcome<BoxedValue>> {
        loop {
            if work.execute_count() == 0 && pool.cancel_token().is_cancelled() {
                return Some(WorkOutcome::Cancelled);
            }

            let cancel = pool.cancel_token();
            let control = work.control(pool.pause_gate(), &cancel);
            control.pause_if_requested();

            work.increment_execute_count();
            let result = panic::catch_unwind(AssertUnwindSafe(|| (work.body())(&control)));

            let outcome = match result {
                Ok(Ok(value)) => WorkOutcome::Succeeded(value),
                Ok(Err(WorkError::StopRequested)) => WorkOutcome::Stopped,
                Ok(Err(e)) => WorkOutcome::Failed(e),
                Err(panic) => WorkOutcome::Failed(WorkError::Panic(panic_message(&panic))),
            };

            if matches!(outcome, WorkOutcome::Succeeded(_)) {
                return Some(outcome);
            }

            let retry = work.options.retry;
            if work.execute_count() > retry.max_retries {
                return Some(outcome);
            }

            if !retry.backoff.is_zero() {
                thread::sleep(retry.backoff);
            }

            match retry.strategy {
                RetryStrategy::Immediate => continue,
                RetryStrategy::Requeue => {
                    work.set_state(crate::work::WorkState::Waiting);
                    pool.requeue(work.clone());
                    return None;
                }
            }
        }
    }

    fn spawn_timeout_watcher(&self, work: Arc<Work>, timeout: TimeoutOption, pool: &Arc<dyn PoolBackref>) -> TimeoutWatcher {
        let cancel = Arc::new(AtomicBool::new(false));
        let watcher_cancel = cancel.clone();
        let pool_weak = Arc::downgrade(pool);
        let worker_id = self.id;
        thread::spawn(move || {
            thread::sleep(timeout.duration);
            if watcher_cancel.load(Ordering::Acquire) {
                return;
            }
            if work.state().is_terminal() {
                return;
            }
            let Some(pool) = pool_weak.upgrade() else { return };
            pool.events().emit(PoolEvent::WorkTimeout(work.id.clone()));
            if timeout.force_stop {
                if work.try_finalize() {
                    finalize(&work, WorkOutcome::Failed(WorkError::ForcedStop), pool.as_ref());
                }
                pool.replace_abandoned_worker(worker_id);
            } else {
                work.request_stop();
            }
        });
        TimeoutWatcher { cancelled: cancel }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.request_kill();
        self.join();
    }
}

struct TimeoutWatcher {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutWatcher {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Shared by both the normal completion path and a racing forced-timeout
/// watcher; only the caller that won [`Work::try_finalize`] reaches here.
fn finalize(work: &Arc<Work>, outcome: WorkOutcome<BoxedValue>, pool: &dyn PoolBackref) {
    work.record_end_time();
    pool.record_completion(work.queue_duration(), work.execute_duration());

    let (status, error_text) = classify(&outcome);

    pool.events().emit(PoolEvent::WorkEnd {
        id: work.id.clone(),
        status,
        error: error_text,
        queue_time: work.queue_duration(),
        execute_time: work.execute_duration(),
    });

    if let Some(callback) = work.take_callback() {
        callback(outcome);
    } else if let Some(default_callback) = pool.default_callback() {
        default_callback(&work.id, outcome);
    }

    work.set_state(status_to_state(status));
    if status == WorkStatus::Failed {
        pool.mark_failed(&work.id);
    }
    if status == WorkStatus::Stopped {
        pool.events().emit(PoolEvent::WorkStop(work.id.clone()));
    }
    work.signal_done();

    pool.on_work_terminal(work, status);
}

fn classify(outcome: &WorkOutcome<BoxedValue>) -> (WorkStatus, Option<Arc<str>>) {
    match outcome {
        WorkOutcome::Succeeded(_) => (WorkStatus::Succeeded, None),
        WorkOutcome::Failed(e) => (WorkStatus::Failed, Some(Arc::from(e.to_string()))),
        WorkOutcome::Stopped => (WorkStatus::Stopped, None),
        WorkOutcome::Cancelled => (WorkStatus::Cancelled, None),
    }
}

fn status_to_state(status: WorkStatus) -> crate::work::WorkState {
    match status {
        WorkStatus::Succeeded => crate::work::WorkState::Succeeded,
        WorkStatus::Failed => crate::work::WorkState::Failed,
        WorkStatus::Stopped => crate::work::WorkState::Stopped,
        WorkStatus::Cancelled => crate::work::WorkState::Cancelled,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::WorkOptions;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct TestPool {
        events: crate::events::EventBus,
        pause_gate: Gate,
        cancel: Mutex<CancellationToken>,
        idle_returns: AtomicUsize,
        terminal: StdMutex<Vec<(WorkId, WorkStatus)>>,
        retired: AtomicUsize,
    }

    impl TestPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: crate::events::EventBus::new(),
                pause_gate: Gate::new(true),
                cancel: Mutex::new(CancellationToken::new()),
                idle_returns: AtomicUsize::new(0),
                terminal: StdMutex::new(Vec::new()),
                retired: AtomicUsize::new(0),
            })
        }
    }

    impl PoolBackref for TestPool {
        fn pause_gate(&self) -> &Gate {
            &self.pause_gate
        }
        fn cancel_token(&self) -> CancellationToken {
            self.cancel.lock().clone()
        }
        fn events(&self) -> &crate::events::EventBus {
            &self.events
        }
        fn default_callback(&self) -> Option<crate::work::DefaultCallback> {
            None
        }
        fn default_work_timeout(&self) -> Option<TimeoutOption> {
            None
        }
        fn destroy_thread_option(&self) -> DestroyThreadOption {
            DestroyThreadOption::default()
        }
        fn alive_worker_count(&self) -> usize {
            1
        }
        fn is_stopping(&self) -> bool {
            false
        }
        fn record_completion(&self, _queue_time: Duration, _execute_time: Duration) {}
        fn on_work_terminal(&self, work: &Arc<Work>, status: WorkStatus) {
            self.terminal.lock().unwrap().push((work.id.clone(), status));
        }
        fn mark_failed(&self, _id: &WorkId) {}
        fn requeue(&self, _work: Arc<Work>) {}
        fn return_idle(&self, _worker: Arc<Worker>) {
            self.idle_returns.fetch_add(1, Ordering::SeqCst);
        }
        fn retire_worker(&self, _worker_id: WorkerId) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
        fn replace_abandoned_worker(&self, _worker_id: WorkerId) {}
    }

    #[test]
    fn executes_assigned_work_and_reports_terminal() {
        let pool = TestPool::new();
        let worker = Worker::spawn(Arc::downgrade(&(pool.clone() as Arc<dyn PoolBackref>)), PriorityKind::Queue);

        let body: crate::work::WorkBody = Box::new(|_ctl| Ok(Box::new(7i32) as BoxedValue));
        let id = WorkId::generate();
        let work = Arc::new(Work::new(id.clone(), body, None, WorkOptions::new()));
        work.record_queue_time();
        worker.assign(work);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.terminal.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let terminal = pool.terminal.lock().unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0], (id, WorkStatus::Succeeded));
    }

    #[test]
    fn claim_is_exclusive() {
        let pool = TestPool::new();
        let worker = Worker::spawn(Arc::downgrade(&(pool as Arc<dyn PoolBackref>)), PriorityKind::Queue);
        assert!(worker.try_claim());
        assert!(!worker.try_claim());
        worker.release_claim();
        assert!(worker.try_claim());
    }

    #[test]
    fn cooperative_stop_is_observed_by_body() {
        let pool = TestPool::new();
        let worker = Worker::spawn(Arc::downgrade(&(pool.clone() as Arc<dyn PoolBackref>)), PriorityKind::Queue);

        let body: crate::work::WorkBody = Box::new(|ctl| {
            loop {
                if ctl.check_if_requested_stop() {
                    return ctl.stop_if_requested().map(|_| Box::new(()) as BoxedValue);
                }
                thread::sleep(Duration::from_millis(5));
            }
        });
        let id = WorkId::generate();
        let work = Arc::new(Work::new(id.clone(), body, None, WorkOptions::new()));
        work.record_queue_time();
        worker.assign(work.clone());

        thread::sleep(Duration::from_millis(30));
        work.request_stop();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.terminal.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let terminal = pool.terminal.lock().unwrap();
        assert_eq!(terminal[0], (id, WorkStatus::Stopped));
    }
}
