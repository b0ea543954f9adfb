//! The reverse-dependency index and the suspended-start holding queue.
//!
//! A work's own outstanding prerequisite set lives on [`crate::work::Work`]
//! itself; this module holds the other direction — given a prerequisite
//! that just went terminal, who is waiting on it — plus the queue used when
//! the pool is configured to start suspended.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::id::WorkId;

/// Maps a prerequisite id to the dependents currently blocked on it, and
/// holds ids submitted while the pool has not yet been started.
#[derive(Default)]
pub(crate) struct DependencyIndex {
    reverse: Mutex<HashMap<WorkId, HashSet<WorkId>>>,
    suspended: Mutex<VecDeque<WorkId>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` is blocked on `prerequisite`.
    pub fn add_edge(&self, prerequisite: WorkId, dependent: WorkId) {
        self.reverse.lock().entry(prerequisite).or_default().insert(dependent);
    }

    /// `prerequisite` reached a terminal state; returns the dependents that
    /// were waiting specifically on it, for the caller to re-check.
    pub fn take_dependents(&self, prerequisite: &WorkId) -> HashSet<WorkId> {
        self.reverse.lock().remove(prerequisite).unwrap_or_default()
    }

    pub fn push_suspended(&self, id: WorkId) {
        self.suspended.lock().push_back(id);
    }

    /// Drain the suspended queue in insertion order.
    pub fn drain_suspended(&self) -> Vec<WorkId> {
        self.suspended.lock().drain(..).collect()
    }
}
