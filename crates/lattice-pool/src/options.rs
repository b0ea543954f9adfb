//! Configuration records for the pool and for individual works.

use std::time::Duration;

use crate::id::WorkId;
use crate::work::DefaultCallback;

/// Relative OS scheduling hint for a work's executing thread.
///
/// This is advisory: the pool does not guarantee preemptive priority
/// scheduling of OS threads, only that the hint is recorded and available
/// to platform-specific extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThreadPriority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

/// A timeout paired with the forcing behavior to apply when it elapses.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutOption {
    /// How long to wait before the timeout fires.
    pub duration: Duration,
    /// If `true`, a forced stop (thread interrupt + worker self-destruction)
    /// is used once the timeout elapses. If `false`, a cooperative stop is
    /// requested instead.
    pub force_stop: bool,
}

impl TimeoutOption {
    /// Create a cooperative timeout (`force_stop = false`).
    pub fn cooperative(duration: Duration) -> Self {
        Self { duration, force_stop: false }
    }

    /// Create a forced timeout (`force_stop = true`).
    pub fn forced(duration: Duration) -> Self {
        Self { duration, force_stop: true }
    }
}

/// Controls whether idle worker threads above `min_threads` are destroyed
/// after a period of inactivity.
#[derive(Debug, Clone, Copy)]
pub struct DestroyThreadOption {
    /// The floor below which alive worker threads are never destroyed.
    pub min_threads: usize,
    /// How long an idle worker above `min_threads` waits before
    /// self-destructing.
    pub keep_alive: Duration,
}

impl Default for DestroyThreadOption {
    fn default() -> Self {
        Self {
            min_threads: 0,
            keep_alive: Duration::from_secs(10),
        }
    }
}

/// How a work should be retried after a non-`Succeeded` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry immediately on the same worker, without going back through
    /// dispatch.
    Immediate,
    /// Re-submit the work to the dispatcher as if freshly queued,
    /// incrementing its execute count.
    Requeue,
}

/// Retry policy for a work.
#[derive(Debug, Clone, Copy)]
pub struct RetryOption {
    /// Attempts remaining after the first execution.
    pub max_retries: u32,
    /// How a retry is carried out.
    pub strategy: RetryStrategy,
    /// Delay before each retry attempt.
    pub backoff: Duration,
}

impl RetryOption {
    /// No retries.
    pub fn none() -> Self {
        Self { max_retries: 0, strategy: RetryStrategy::Immediate, backoff: Duration::ZERO }
    }
}

impl Default for RetryOption {
    fn default() -> Self {
        Self::none()
    }
}

/// Per-work configuration.
#[derive(Clone, Default)]
pub struct WorkOptions {
    /// Dispatch priority; higher values run first. Default 0.
    pub priority: i32,
    /// OS scheduling hint for the executing thread.
    pub thread_priority: ThreadPriority,
    /// Per-work timeout overriding the pool's default.
    pub timeout: Option<TimeoutOption>,
    /// Ids of works that must reach a terminal state before this one is
    /// eligible to dispatch.
    pub dependents: Vec<WorkId>,
    /// A caller-chosen id. If absent, one is generated.
    pub custom_id: Option<WorkId>,
    /// Group label for bulk operations.
    pub group: Option<String>,
    /// Marks this work as long-running: its worker is excluded from the
    /// short-task load-balancing pool and does not count against
    /// `max_threads` when deciding whether to grow the pool.
    pub long_running: bool,
    /// Retry policy applied on non-`Succeeded` outcomes.
    pub retry: RetryOption,
}

impl WorkOptions {
    /// Start building options with defaults (priority 0, no dependents, no retry).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_thread_priority(mut self, priority: ThreadPriority) -> Self {
        self.thread_priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutOption) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dependents(mut self, dependents: impl IntoIterator<Item = WorkId>) -> Self {
        self.dependents = dependents.into_iter().collect();
        self
    }

    pub fn with_custom_id(mut self, id: impl Into<WorkId>) -> Self {
        self.custom_id = Some(id.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn with_retry(mut self, retry: RetryOption) -> Self {
        self.retry = retry;
        self
    }
}

/// Pool-wide configuration.
#[derive(Clone)]
pub struct PoolOptions {
    /// Maximum number of non-long-running workers alive at once.
    pub max_threads: usize,
    /// Controls destruction of idle workers above the floor.
    pub destroy_thread: DestroyThreadOption,
    /// Pool-wide timeout: fires if no worker frees up for this long.
    pub timeout: Option<TimeoutOption>,
    /// Default per-work timeout applied when a work specifies none.
    pub default_work_timeout: Option<TimeoutOption>,
    /// Priority collection discipline for each worker's private queue.
    pub priority_kind: crate::priority::PriorityKind,
    /// If `true`, submissions are held until [`crate::pool::PowerPool::start`]
    /// is called instead of dispatching immediately.
    pub start_suspended: bool,
    /// Invoked for any completed work that was not given its own callback.
    pub default_callback: Option<DefaultCallback>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_threads: cores * 2,
            destroy_thread: DestroyThreadOption::default(),
            timeout: None,
            default_work_timeout: None,
            priority_kind: crate::priority::PriorityKind::Queue,
            start_suspended: false,
            default_callback: None,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_destroy_thread(mut self, opt: DestroyThreadOption) -> Self {
        self.destroy_thread = opt;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutOption) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_default_work_timeout(mut self, timeout: TimeoutOption) -> Self {
        self.default_work_timeout = Some(timeout);
        self
    }

    pub fn with_priority_kind(mut self, kind: crate::priority::PriorityKind) -> Self {
        self.priority_kind = kind;
        self
    }

    pub fn with_start_suspended(mut self, suspended: bool) -> Self {
        self.start_suspended = suspended;
        self
    }

    pub fn with_default_callback(mut self, callback: DefaultCallback) -> Self {
        self.default_callback = Some(callback);
        self
    }

    /// Validate configuration, per spec.md section 6/7: `MinThreads` may
    /// not exceed `MaxThreads`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.destroy_thread.min_threads > self.max_threads {
            return Err(crate::error::PoolError::InvalidThreadConfig {
                min: self.destroy_thread.min_threads,
                max: self.max_threads,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_thread_config_is_rejected() {
        let opts = PoolOptions::new()
            .with_max_threads(10)
            .with_destroy_thread(DestroyThreadOption { min_threads: 100, keep_alive: Duration::ZERO });
        assert!(matches!(opts.validate(), Err(crate::error::PoolError::InvalidThreadConfig { min: 100, max: 10 })));
    }

    #[test]
    fn default_max_threads_is_positive() {
        assert!(PoolOptions::default().max_threads > 0);
    }
}
