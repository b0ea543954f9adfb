//! A general-purpose, in-process work pool.
//!
//! `lattice-pool` dispatches user-supplied closures ("works") onto a bounded
//! set of worker threads, with priority ordering, dependency gating,
//! cooperative cancellation, per-work retries, pause/resume, grouping, and
//! an observable event stream. It has no async runtime dependency and no
//! global state: every [`PowerPool`] is an independent instance.
//!
//! ```
//! use lattice_pool::{PowerPool, WorkOptions};
//!
//! let pool = PowerPool::new(PowerPool::builder().with_max_threads(4)).unwrap();
//! let id = pool
//!     .submit(|_ctl| Ok::<_, lattice_pool::WorkError>(1 + 1), WorkOptions::new())
//!     .unwrap();
//! pool.wait_work(&id);
//! pool.wait();
//! ```
//!
//! # Error propagation
//!
//! A work body's error never unwinds into the caller of [`PowerPool::queue`]
//! or [`PowerPool::submit`] — it travels through [`PoolEvent::WorkEnd`] and
//! the work's callback (or the pool's [`PoolOptions::default_callback`]) as
//! a [`WorkOutcome`]. [`PoolError`] is reserved for the pool's own
//! configuration and disposal boundary (invalid thread bounds, a duplicate
//! custom id, submission after [`PowerPool::dispose`]).

mod dependency;
mod error;
mod events;
mod group;
mod id;
mod logging;
mod options;
mod pool;
mod priority;
mod sync;
mod work;
mod worker;

pub use error::{PoolError, Result, WorkError, WorkOutcome};
pub use events::{PoolEvent, WorkStatus};
pub use group::Group;
pub use id::{WorkId, WorkerId};
pub use options::{
    DestroyThreadOption, PoolOptions, RetryOption, RetryStrategy, ThreadPriority, TimeoutOption, WorkOptions,
};
pub use pool::PowerPool;
pub use priority::PriorityKind;
pub use work::{BoxedValue, DefaultCallback, WorkBody, WorkCallback, WorkControl, WorkState};

static_assertions::assert_impl_all!(PowerPool: Send, Sync);
static_assertions::assert_impl_all!(WorkId: Send, Sync);
