//! The dispatcher: `PowerPool`, the public handle, and `PoolCore`, the
//! shared state every worker holds a [`crate::worker::PoolBackref`] to.
//!
//! `PoolCore` never hands out a strong reference to itself to a worker —
//! workers are only ever given `Arc::downgrade`d handles — but it keeps one
//! `Weak<PoolCore>` pointing at itself (set up with `Arc::new_cyclic`) so
//! its own methods can mint a fresh `Weak<dyn PoolBackref>` whenever a new
//! worker needs to be spawned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dependency::DependencyIndex;
use crate::error::{PoolError, Result};
use crate::events::{EventBus, PoolEvent, WorkStatus};
use crate::group::Group;
use crate::id::{WorkId, WorkerId};
use crate::logging::targets;
use crate::options::{DestroyThreadOption, PoolOptions, TimeoutOption, WorkOptions};
use crate::sync::{CancellationToken, Gate};
use crate::work::{BoxedValue, Work, WorkBody, WorkCallback, WorkControl};
use crate::worker::{PoolBackref, Worker, WorkerState};

/// The pool's lifecycle state. `IdleChecked` is a transient CAS guard
/// observed only while an idle sweep is in flight — it never persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    NotRunning,
    Running,
    IdleChecked,
}

struct PoolCore {
    weak_self: Weak<PoolCore>,
    options: PoolOptions,

    alive_workers: Mutex<HashMap<WorkerId, Arc<Worker>>>,
    idle_workers: Mutex<VecDeque<WorkerId>>,
    create_worker_lock: Mutex<()>,

    setted_works: Mutex<HashMap<WorkId, Arc<Work>>>,
    group_index: Mutex<HashMap<String, HashSet<WorkId>>>,
    dependency_index: DependencyIndex,
    failed_set: Mutex<HashSet<WorkId>>,

    state: Mutex<PoolState>,
    epoch: AtomicU64,
    stopping: AtomicBool,
    disposed: AtomicBool,
    suspended_started: AtomicBool,

    cancel_token: Mutex<CancellationToken>,
    pause_gate: Gate,
    wait_all_gate: Gate,
    events: EventBus,

    completed_count: AtomicU64,
    total_queue_nanos: AtomicU64,
    total_execute_nanos: AtomicU64,
}

impl PoolCore {
    fn new(options: PoolOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            options,
            alive_workers: Mutex::new(HashMap::new()),
            idle_workers: Mutex::new(VecDeque::new()),
            create_worker_lock: Mutex::new(()),
            setted_works: Mutex::new(HashMap::new()),
            group_index: Mutex::new(HashMap::new()),
            dependency_index: DependencyIndex::new(),
            failed_set: Mutex::new(HashSet::new()),
            state: Mutex::new(PoolState::NotRunning),
            epoch: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            suspended_started: AtomicBool::new(false),
            cancel_token: Mutex::new(CancellationToken::new()),
            pause_gate: Gate::new(true),
            wait_all_gate: Gate::new(true),
            events: EventBus::new(),
            completed_count: AtomicU64::new(0),
            total_queue_nanos: AtomicU64::new(0),
            total_execute_nanos: AtomicU64::new(0),
        })
    }

    fn strong_self(&self) -> Arc<PoolCore> {
        self.weak_self.upgrade().expect("pool core outlives its own workers")
    }

    fn backref(&self) -> Weak<dyn PoolBackref> {
        let strong = self.strong_self() as Arc<dyn PoolBackref>;
        Arc::downgrade(&strong)
    }

    fn find_work(&self, id: &WorkId) -> Option<Arc<Work>> {
        self.setted_works.lock().get(id).cloned()
    }

    fn waiting_work_count(&self) -> usize {
        self.setted_works
            .lock()
            .values()
            .filter(|w| w.state() == crate::work::WorkState::Waiting)
            .count()
    }

    fn long_running_worker_count(&self) -> usize {
        self.alive_workers
            .lock()
            .values()
            .filter(|w| w.is_long_running() && w.state() == WorkerState::Running)
            .count()
    }

    /// `GetWorker`: reuse an idle worker, else grow under the (long-running
    /// extended) cap, else balance across currently busy workers.
    fn get_worker(&self, long_running: bool) -> Arc<Worker> {
        loop {
            let popped = self.idle_workers.lock().pop_front();
            let Some(worker_id) = popped else { break };
            let Some(worker) = self.alive_workers.lock().get(&worker_id).cloned() else {
                continue; // retired between becoming idle and now
            };
            if worker.try_claim() {
                worker.set_long_running(long_running);
                return worker;
            }
        }

        {
            let _guard = self.create_worker_lock.lock();
            let cap = self.options.max_threads + self.long_running_worker_count();
            if self.alive_workers.lock().len() < cap {
                let worker = Worker::spawn(self.backref(), self.options.priority_kind);
                worker.try_claim();
                worker.set_long_running(long_running);
                self.alive_workers.lock().insert(worker.id, worker.clone());
                return worker;
            }
        }

        loop {
            let mut claimed: Option<Arc<Worker>> = None;
            let candidates: Vec<Arc<Worker>> = self.alive_workers.lock().values().cloned().collect();
            for worker in candidates {
                if worker.state() == WorkerState::Running && worker.is_long_running() {
                    continue;
                }
                let is_better = match &claimed {
                    None => true,
                    Some(current) => worker.pending_len() < current.pending_len(),
                };
                if !is_better {
                    continue;
                }
                if !worker.try_claim() {
                    continue;
                }
                if let Some(previous) = claimed.take() {
                    previous.release_claim();
                }
                claimed = Some(worker);
            }
            if let Some(winner) = claimed {
                winner.set_long_running(long_running);
                return winner;
            }
            // Every worker is presently busy with a long-running work;
            // capacity frees up once one finishes.
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn dispatch_to_worker(&self, work: Arc<Work>) {
        let worker = self.get_worker(work.options.long_running);
        work.record_queue_time();
        worker.assign(work);
        worker.release_claim();
    }

    fn ensure_running(&self) {
        let mut state = self.state.lock();
        if *state != PoolState::NotRunning {
            return;
        }
        *state = PoolState::Running;
        drop(state);

        self.stopping.store(false, Ordering::Release);
        self.failed_set.lock().clear();
        self.wait_all_gate.close();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.events.emit(PoolEvent::PoolStart);
        tracing::info!(target: targets::POOL, epoch, "pool started");

        if let Some(timeout) = self.options.timeout {
            self.spawn_pool_timeout_watcher(timeout, epoch);
        }
    }

    fn spawn_pool_timeout_watcher(&self, timeout: TimeoutOption, epoch: u64) {
        let pool = self.weak_self.clone();
        thread::spawn(move || {
            thread::sleep(timeout.duration);
            let Some(pool) = pool.upgrade() else { return };
            if pool.epoch.load(Ordering::Acquire) != epoch {
                return; // a new epoch started (or the pool went idle) since
            }
            if *pool.state.lock() != PoolState::Running {
                return;
            }
            pool.events.emit(PoolEvent::PoolTimeout);
            tracing::warn!(target: targets::POOL, "pool-wide timeout elapsed");
            if timeout.force_stop {
                pool.force_stop();
            }
        });
    }

    fn register_dependencies_and_maybe_dispatch(&self, work: Arc<Work>) {
        if work.has_dependents() {
            for prerequisite in work.dependent_ids() {
                let already_done = self
                    .find_work(&prerequisite)
                    .map(|p| p.state().is_terminal())
                    .unwrap_or(true);
                if already_done {
                    work.resolve_dependency(&prerequisite);
                } else {
                    self.dependency_index.add_edge(prerequisite, work.id.clone());
                }
            }
        }
        if work.is_ready_to_dispatch() {
            self.dispatch_to_worker(work);
        }
    }

    fn submit(&self, body: WorkBody, options: WorkOptions, callback: Option<WorkCallback>) -> Result<WorkId> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::PoolDisposed);
        }

        let id = match &options.custom_id {
            Some(custom) => {
                if self.setted_works.lock().contains_key(custom) {
                    return Err(PoolError::DuplicateWorkId(custom.clone()));
                }
                custom.clone()
            }
            None => WorkId::generate(),
        };

        let work = Arc::new(Work::new(id.clone(), body, callback, options));
        self.setted_works.lock().insert(id.clone(), work.clone());
        if let Some(group) = &work.options.group {
            self.group_index.lock().entry(group.clone()).or_default().insert(id.clone());
        }

        if self.options.start_suspended && !self.suspended_started.load(Ordering::Acquire) {
            self.dependency_index.push_suspended(id.clone());
            return Ok(id);
        }

        self.ensure_running();
        self.register_dependencies_and_maybe_dispatch(work);
        Ok(id)
    }

    fn start(&self) {
        self.suspended_started.store(true, Ordering::Release);
        let drained = self.dependency_index.drain_suspended();
        if drained.is_empty() {
            return;
        }
        self.ensure_running();
        for id in drained {
            if let Some(work) = self.find_work(&id) {
                self.register_dependencies_and_maybe_dispatch(work);
            }
        }
    }

    /// Cooperative stop: signal cancellation and let in-flight bodies wind
    /// down on their own.
    fn cooperative_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cancel_token.lock().cancel();
    }

    /// Forced stop: cooperative stop, plus abandon every worker thread
    /// immediately and clear the work/group registries. Rust cannot safely
    /// interrupt a running OS thread, so "forced" here means the pool stops
    /// waiting on and tracking the worker — it exits on its own once its
    /// current body returns.
    fn force_stop(&self) {
        self.cooperative_stop();
        for worker in self.alive_workers.lock().values() {
            worker.stop_current_work();
        }
        self.setted_works.lock().clear();
        self.group_index.lock().clear();
        let abandoned: Vec<Arc<Worker>> = self.alive_workers.lock().drain().map(|(_, w)| w).collect();
        self.idle_workers.lock().clear();
        for worker in abandoned {
            worker.request_kill();
        }
    }

    fn remove_from_registries(&self, work: &Arc<Work>) {
        self.setted_works.lock().remove(&work.id);
        if let Some(group) = &work.options.group {
            if let Some(members) = self.group_index.lock().get_mut(group) {
                members.remove(&work.id);
            }
        }
    }

    fn release_dependents(&self, id: &WorkId) {
        for dependent_id in self.dependency_index.take_dependents(id) {
            if let Some(dependent) = self.find_work(&dependent_id) {
                if dependent.resolve_dependency(id) {
                    self.dispatch_to_worker(dependent);
                }
            }
        }
    }

    fn maybe_idle_sweep(&self) {
        let mut state = self.state.lock();
        if *state != PoolState::Running {
            return;
        }
        if self.running_worker_count() != 0 || self.waiting_work_count() != 0 {
            return;
        }
        *state = PoolState::IdleChecked;
        self.events.emit(PoolEvent::PoolIdle);
        tracing::info!(target: targets::POOL, "pool idle");
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *self.cancel_token.lock() = CancellationToken::new();
        self.pause_gate.open();
        self.stopping.store(false, Ordering::Release);
        *state = PoolState::NotRunning;
        drop(state);
        self.wait_all_gate.open();
    }

    fn running_worker_count(&self) -> usize {
        let alive_len = self.alive_workers.lock().len();
        let idle_len = self.idle_workers.lock().len();
        alive_len.saturating_sub(idle_len)
    }
}

impl PoolBackref for PoolCore {
    fn pause_gate(&self) -> &Gate {
        &self.pause_gate
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.lock().clone()
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn default_callback(&self) -> Option<crate::work::DefaultCallback> {
        self.options.default_callback.clone()
    }

    fn default_work_timeout(&self) -> Option<TimeoutOption> {
        self.options.default_work_timeout
    }

    fn destroy_thread_option(&self) -> DestroyThreadOption {
        self.options.destroy_thread
    }

    fn alive_worker_count(&self) -> usize {
        self.alive_workers.lock().len()
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn record_completion(&self, queue_time: Duration, execute_time: Duration) {
        self.completed_count.fetch_add(1, Ordering::AcqRel);
        self.total_queue_nanos.fetch_add(queue_time.as_nanos() as u64, Ordering::AcqRel);
        self.total_execute_nanos.fetch_add(execute_time.as_nanos() as u64, Ordering::AcqRel);
    }

    fn on_work_terminal(&self, work: &Arc<Work>, _status: WorkStatus) {
        self.remove_from_registries(work);
        self.release_dependents(&work.id);
        self.maybe_idle_sweep();
    }

    fn mark_failed(&self, id: &WorkId) {
        self.failed_set.lock().insert(id.clone());
    }

    fn requeue(&self, work: Arc<Work>) {
        self.dispatch_to_worker(work);
    }

    fn return_idle(&self, worker: Arc<Worker>) {
        self.idle_workers.lock().push_back(worker.id);
        self.maybe_idle_sweep();
    }

    fn retire_worker(&self, worker_id: WorkerId) {
        self.alive_workers.lock().remove(&worker_id);
        self.idle_workers.lock().retain(|id| *id != worker_id);
    }

    fn replace_abandoned_worker(&self, worker_id: WorkerId) {
        // Drop the abandoned worker from the registry, freeing its slot
        // under `max_threads`. The replacement itself is lazy: the next
        // `get_worker` call sees room under the cap and spawns a fresh
        // worker on demand, rather than this method eagerly spawning one
        // that might sit idle.
        self.alive_workers.lock().remove(&worker_id);
        self.idle_workers.lock().retain(|id| *id != worker_id);
    }
}

/// A general-purpose, in-process work pool: priority dispatch, dependency
/// gating, cooperative cancellation, retries, and grouped bulk operations
/// over a bounded set of worker threads.
pub struct PowerPool {
    core: Arc<PoolCore>,
}

impl PowerPool {
    /// Construct a pool from validated options.
    pub fn new(options: PoolOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { core: PoolCore::new(options) })
    }

    /// Start building [`PoolOptions`] for [`PowerPool::new`].
    pub fn builder() -> PoolOptions {
        PoolOptions::new()
    }

    /// The canonical submission entry point. Every other `queue*`/`submit*`
    /// convenience funnels through this.
    pub fn queue(&self, body: WorkBody, options: WorkOptions, callback: Option<WorkCallback>) -> Result<WorkId> {
        self.core.submit(body, options, callback)
    }

    /// Ergonomic wrapper around [`PowerPool::queue`] for a typed body with
    /// no explicit callback (the pool's [`crate::options::PoolOptions::default_callback`],
    /// if any, still runs).
    pub fn submit<F, T, E>(&self, body: F, options: WorkOptions) -> Result<WorkId>
    where
        F: Fn(&WorkControl<'_>) -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Send + 'static,
        E: Into<crate::error::WorkError>,
    {
        let wrapped: WorkBody = Box::new(move |ctl| body(ctl).map(|v| Box::new(v) as BoxedValue).map_err(Into::into));
        self.queue(wrapped, options, None)
    }

    /// Drain the suspended-start holding queue (no-op if the pool was not
    /// configured with [`crate::options::PoolOptions::start_suspended`]).
    pub fn start(&self) {
        self.core.start();
    }

    /// Request a stop. Cooperative (`force = false`) signals every
    /// in-flight body via the pool's cancellation token and lets it wind
    /// down on its own. Forced (`force = true`) additionally abandons every
    /// worker thread immediately (Rust cannot safely interrupt a running OS
    /// thread, so an abandoned worker is simply no longer tracked — it
    /// exits on its own once its current body returns) and clears the work
    /// and group registries right away.
    pub fn stop(&self, force: bool) {
        if force {
            self.core.force_stop();
        } else {
            self.core.cooperative_stop();
        }
    }

    /// Pause every worker: in-flight bodies that cooperate via
    /// [`WorkControl::pause_if_requested`] block until [`PowerPool::resume`].
    pub fn pause(&self) {
        self.core.pause_gate.close();
    }

    pub fn resume(&self) {
        self.core.pause_gate.open();
    }

    /// Pause a single work. Errs with [`PoolError::UnknownWork`] if `id` is
    /// not present in the registry (never submitted, or already reaped
    /// after reaching a terminal state).
    pub fn pause_work(&self, id: &WorkId) -> Result<()> {
        let work = self.core.find_work(id).ok_or_else(|| PoolError::UnknownWork(id.clone()))?;
        work.pause();
        Ok(())
    }

    pub fn resume_work(&self, id: &WorkId) -> Result<()> {
        let work = self.core.find_work(id).ok_or_else(|| PoolError::UnknownWork(id.clone()))?;
        work.resume();
        Ok(())
    }

    /// Cooperatively stop a single work. Errs with [`PoolError::UnknownWork`]
    /// if `id` is not present in the registry; a no-op if it is present but
    /// already terminal.
    pub fn stop_work(&self, id: &WorkId) -> Result<()> {
        let work = self.core.find_work(id).ok_or_else(|| PoolError::UnknownWork(id.clone()))?;
        if !work.state().is_terminal() {
            work.request_stop();
        }
        Ok(())
    }

    /// Cancel a work. If it has not started, it transitions directly to
    /// `Cancelled` without ever emitting `WorkEnd` or running a callback —
    /// per the testable property that `WorkEnd` fires once per submitted id
    /// that was not cancelled before it started. If it is already running,
    /// this is equivalent to [`PowerPool::stop_work`]: the work finishes
    /// its normal terminal path with a `Stopped` status. Errs with
    /// [`PoolError::UnknownWork`] if `id` is not present in the registry.
    pub fn cancel_work(&self, id: &WorkId) -> Result<()> {
        let work = self.core.find_work(id).ok_or_else(|| PoolError::UnknownWork(id.clone()))?;
        if work.state() == crate::work::WorkState::Waiting && work.try_finalize() {
            work.set_state(crate::work::WorkState::Cancelled);
            work.signal_done();
            self.core.remove_from_registries(&work);
            self.core.release_dependents(&work.id);
            self.core.maybe_idle_sweep();
            return Ok(());
        }
        // Either already running, or a worker won the race to start it
        // between the check above and `try_finalize` — either way it has
        // begun, so fall back to a cooperative stop. A no-op if it has
        // since reached a terminal state on its own.
        if !work.state().is_terminal() {
            work.request_stop();
        }
        Ok(())
    }

    /// Block until the pool has no running or waiting work.
    pub fn wait(&self) {
        self.core.wait_all_gate.wait();
    }

    /// Block until `id` reaches a terminal state. Returns immediately if
    /// `id` is unknown (already finished, or never existed).
    pub fn wait_work(&self, id: &WorkId) {
        if let Some(work) = self.core.find_work(id) {
            work.wait();
        }
    }

    /// Permanently shut the pool down: equivalent to a forced [`PowerPool::stop`]
    /// plus refusing all future submissions. Idempotent.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop(true);
    }

    /// The pool's event stream. Subscribers run synchronously on whichever
    /// thread raised the event (see [`crate::events::EventBus`]) — calling
    /// back into pool accessors like [`PowerPool::pool_running`] or
    /// [`PowerPool::wait`] from within a subscriber on that same thread can
    /// deadlock against the pool's own internal locks.
    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    /// A facade for bulk operations over every work submitted under `label`.
    pub fn group(&self, label: impl Into<String>) -> Group<'_> {
        Group::new(self, label.into())
    }

    pub(crate) fn group_members(&self, label: &str) -> Vec<WorkId> {
        self.core.group_index.lock().get(label).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.core.idle_workers.lock().len()
    }

    pub fn running_worker_count(&self) -> usize {
        self.core.running_worker_count()
    }

    pub fn alive_worker_count(&self) -> usize {
        self.core.alive_workers.lock().len()
    }

    pub fn long_running_worker_count(&self) -> usize {
        self.core.long_running_worker_count()
    }

    /// The current state of `id`, or `None` if it is unknown (finished and
    /// already reaped, or never submitted).
    pub fn work_state(&self, id: &WorkId) -> Option<crate::work::WorkState> {
        self.core.find_work(id).map(|w| w.state())
    }

    pub fn waiting_work_count(&self) -> usize {
        self.core.waiting_work_count()
    }

    pub fn waiting_work_list(&self) -> Vec<WorkId> {
        self.core
            .setted_works
            .lock()
            .values()
            .filter(|w| w.state() == crate::work::WorkState::Waiting)
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn failed_work_list(&self) -> Vec<WorkId> {
        self.core.failed_set.lock().iter().cloned().collect()
    }

    pub fn total_queue_time(&self) -> Duration {
        Duration::from_nanos(self.core.total_queue_nanos.load(Ordering::Acquire))
    }

    pub fn total_execute_time(&self) -> Duration {
        Duration::from_nanos(self.core.total_execute_nanos.load(Ordering::Acquire))
    }

    pub fn total_elapsed_time(&self) -> Duration {
        self.total_queue_time() + self.total_execute_time()
    }

    /// Mean queue time across completed works. `Duration::ZERO` if none
    /// have completed yet — the source's divide-by-zero is undefined here
    /// by design; see `DESIGN.md`.
    pub fn average_queue_time(&self) -> Duration {
        self.average_of(self.core.total_queue_nanos.load(Ordering::Acquire))
    }

    pub fn average_execute_time(&self) -> Duration {
        self.average_of(self.core.total_execute_nanos.load(Ordering::Acquire))
    }

    pub fn average_elapsed_time(&self) -> Duration {
        let count = self.core.completed_count.load(Ordering::Acquire);
        if count == 0 {
            return Duration::ZERO;
        }
        self.total_elapsed_time() / count as u32
    }

    fn average_of(&self, total_nanos: u64) -> Duration {
        let count = self.core.completed_count.load(Ordering::Acquire);
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_nanos) / count as u32
        }
    }

    /// `true` once the pool has accepted at least one work and has not yet
    /// returned to `NotRunning`.
    pub fn pool_running(&self) -> bool {
        !matches!(*self.core.state.lock(), PoolState::NotRunning)
    }

    pub fn pool_stopping(&self) -> bool {
        self.core.stopping.load(Ordering::Acquire)
    }
}

impl Drop for PowerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}
