//! The priority-ordered collection backing each worker's private queue.
//!
//! Two variants are selected at construction: a **priority queue** (FIFO
//! within a priority bucket) and a **priority stack** (LIFO within a
//! bucket). Both return the item with the largest priority first; ties are
//! broken by insertion order within the bucket, in FIFO or LIFO fashion
//! respectively.
//!
//! Buckets are never reclaimed once created — an empty bucket left behind
//! after a `get()` drains it is harmless and saves a rebuild of the sorted
//! priority list on the (common) case where the same priority is reused.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// Whether a [`PriorityCollection`] behaves as a FIFO queue or a LIFO stack
/// within each priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityKind {
    /// First-in, first-out within a priority bucket.
    Queue,
    /// Last-in, first-out within a priority bucket.
    Stack,
}

struct Inner<T> {
    buckets: HashMap<i32, VecDeque<T>>,
    /// Priorities known to have held at least one item, sorted descending.
    /// Rebuilt lazily when a priority not yet in this list is used.
    sorted_priorities: Vec<i32>,
    dirty: bool,
    len: usize,
}

/// A concurrent, priority-ordered collection of items.
///
/// `set` inserts an item under a priority; `get` removes and returns the
/// item with the highest priority currently present, breaking ties per the
/// collection's [`PriorityKind`].
pub struct PriorityCollection<T> {
    kind: PriorityKind,
    inner: Mutex<Inner<T>>,
}

impl<T> PriorityCollection<T> {
    /// Create an empty collection of the given kind.
    pub fn new(kind: PriorityKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                sorted_priorities: Vec::new(),
                dirty: false,
                len: 0,
            }),
        }
    }

    /// Insert `item` under priority `p`. Higher values are dequeued first.
    pub fn set(&self, item: T, p: i32) {
        let mut inner = self.inner.lock();
        let is_new_priority = !inner.buckets.contains_key(&p);
        inner.buckets.entry(p).or_default().push_back(item);
        inner.len += 1;
        if is_new_priority {
            inner.dirty = true;
        }
    }

    /// Remove and return the item with the highest priority, or `None` if
    /// the collection is empty.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            return None;
        }
        if inner.dirty {
            let mut priorities: Vec<i32> = inner.buckets.keys().copied().collect();
            priorities.sort_unstable_by(|a, b| b.cmp(a));
            inner.sorted_priorities = priorities;
            inner.dirty = false;
        }
        let kind = self.kind;
        for p in inner.sorted_priorities.clone() {
            if let Some(bucket) = inner.buckets.get_mut(&p) {
                let popped = match kind {
                    PriorityKind::Queue => bucket.pop_front(),
                    PriorityKind::Stack => bucket.pop_back(),
                };
                if let Some(item) = popped {
                    inner.len -= 1;
                    return Some(item);
                }
            }
        }
        None
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Whether the collection currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_wins() {
        let q = PriorityCollection::new(PriorityKind::Queue);
        q.set("low", 0);
        q.set("high", 5);
        assert_eq!(q.get(), Some("high"));
        assert_eq!(q.get(), Some("low"));
        assert_eq!(q.get(), None);
    }

    #[test]
    fn queue_is_fifo_within_bucket() {
        let q = PriorityCollection::new(PriorityKind::Queue);
        q.set(1, 0);
        q.set(2, 0);
        q.set(3, 0);
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), Some(2));
        assert_eq!(q.get(), Some(3));
    }

    #[test]
    fn stack_is_lifo_within_bucket() {
        let s = PriorityCollection::new(PriorityKind::Stack);
        s.set(1, 0);
        s.set(2, 0);
        s.set(3, 0);
        assert_eq!(s.get(), Some(3));
        assert_eq!(s.get(), Some(2));
        assert_eq!(s.get(), Some(1));
    }

    #[test]
    fn priority_drain_order_matches_spec_example() {
        // priorities {0,1,2,0,1,2} -> drain order {2,2,1,1,0,0} for a queue.
        let q = PriorityCollection::new(PriorityKind::Queue);
        for p in [0, 1, 2, 0, 1, 2] {
            q.set(p, p);
        }
        let mut drained = Vec::new();
        while let Some(p) = q.get() {
            drained.push(p);
        }
        assert_eq!(drained, vec![2, 2, 1, 1, 0, 0]);
    }

    #[test]
    fn reused_priority_after_drain_still_works() {
        let q = PriorityCollection::new(PriorityKind::Queue);
        q.set("a", 1);
        assert_eq!(q.get(), Some("a"));
        // Bucket for priority 1 is now empty but left behind.
        q.set("b", 1);
        assert_eq!(q.get(), Some("b"));
    }

    #[test]
    fn len_tracks_inserts_and_removals() {
        let q = PriorityCollection::new(PriorityKind::Queue);
        assert!(q.is_empty());
        q.set(1, 0);
        q.set(2, 1);
        assert_eq!(q.len(), 2);
        q.get();
        assert_eq!(q.len(), 1);
    }
}
