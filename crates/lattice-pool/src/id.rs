//! Opaque identifiers for works and workers.
//!
//! Work ids may be user-supplied (`CustomWorkID`) or system-generated; in
//! either case they are cheap to clone and compare, since they circulate
//! through every registry, event payload, and dependency edge in the pool.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_WORK_SEQ: AtomicU64 = AtomicU64::new(1);
static NEXT_WORKER_SEQ: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a submitted work.
///
/// Cheaply cloneable (an `Arc<str>` under the hood) so it can be copied into
/// events, dependency indexes, and group indexes without repeated
/// allocation.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct WorkId(Arc<str>);

impl WorkId {
    /// Wrap a user-supplied id.
    pub fn custom(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into().into_boxed_str()))
    }

    /// Generate a fresh system id, guaranteed unique for the lifetime of the process.
    pub fn generate() -> Self {
        let seq = NEXT_WORK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("work-{seq}").into_boxed_str()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkId({})", self.0)
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkId {
    fn from(s: &str) -> Self {
        Self::custom(s)
    }
}

impl From<String> for WorkId {
    fn from(s: String) -> Self {
        Self::custom(s)
    }
}

/// A unique identifier for a worker owned by a pool.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn generate() -> Self {
        Self(NEXT_WORKER_SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}
