//! A facade for bulk operations over every work sharing a group label.
//!
//! A group is just an index key (`WorkOptions::with_group`) — there is no
//! separate group object to create or tear down. Each bulk operation takes
//! a snapshot of the label's current membership and forwards to the
//! existing per-id primitives, so a work finishing mid-operation is a race
//! resolved the same way a direct per-id call would resolve it: best
//! effort, not transactional.

use crate::id::WorkId;
use crate::pool::PowerPool;

/// A handle for bulk operations over the works currently tagged with
/// `label`. Borrows the pool; obtain one via [`PowerPool::group`].
pub struct Group<'a> {
    pool: &'a PowerPool,
    label: String,
}

impl<'a> Group<'a> {
    pub(crate) fn new(pool: &'a PowerPool, label: String) -> Self {
        Self { pool, label }
    }

    /// A snapshot of the ids currently tagged with this label.
    pub fn members(&self) -> Vec<WorkId> {
        self.pool.group_members(&self.label)
    }

    /// Block until every member reaches a terminal state.
    pub fn wait(&self) {
        for id in self.members() {
            self.pool.wait_work(&id);
        }
    }

    /// Cooperatively stop every member. Returns the ids that had already
    /// been reaped from the registry by the time their turn came — the
    /// primitive "reported unknown" sublist from the component design.
    pub fn stop(&self) -> Vec<WorkId> {
        self.members().into_iter().filter(|id| self.pool.stop_work(id).is_err()).collect()
    }

    /// Cancel every member. Same "already reaped" return convention as
    /// [`Group::stop`].
    pub fn cancel(&self) -> Vec<WorkId> {
        self.members().into_iter().filter(|id| self.pool.cancel_work(id).is_err()).collect()
    }

    pub fn pause(&self) -> Vec<WorkId> {
        self.members().into_iter().filter(|id| self.pool.pause_work(id).is_err()).collect()
    }

    pub fn resume(&self) -> Vec<WorkId> {
        self.members().into_iter().filter(|id| self.pool.resume_work(id).is_err()).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::options::WorkOptions;
    use crate::pool::PowerPool;
    use crate::work::BoxedValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn members_reflects_group_label_membership() {
        let pool = PowerPool::new(PowerPool::builder().with_max_threads(2)).unwrap();
        for _ in 0..3 {
            pool.queue(Box::new(|_ctl| Ok(Box::new(()) as BoxedValue)), WorkOptions::new().with_group("batch"), None)
                .unwrap();
        }
        pool.queue(Box::new(|_ctl| Ok(Box::new(()) as BoxedValue)), WorkOptions::new(), None).unwrap();

        assert_eq!(pool.group("batch").members().len(), 3);
        assert!(pool.group("unused").members().is_empty());
    }

    #[test]
    fn wait_blocks_until_every_member_is_terminal() {
        let pool = PowerPool::new(PowerPool::builder().with_max_threads(2)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let d = done.clone();
            pool.queue(
                Box::new(move |_ctl| {
                    std::thread::sleep(Duration::from_millis(10));
                    d.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(()) as BoxedValue)
                }),
                WorkOptions::new().with_group("batch"),
                None,
            )
            .unwrap();
        }
        pool.group("batch").wait();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    /// A member that finishes on its own is removed from the group index
    /// along with every other registry, so it is simply absent from a later
    /// snapshot rather than reported back as "unknown".
    #[test]
    fn finished_members_leave_the_group_index() {
        let pool = PowerPool::new(PowerPool::builder().with_max_threads(1)).unwrap();
        let id = pool
            .queue(Box::new(|_ctl| Ok(Box::new(()) as BoxedValue)), WorkOptions::new().with_group("g"), None)
            .unwrap();
        pool.wait_work(&id);
        assert!(pool.group("g").members().is_empty());
    }

    #[test]
    fn cancel_every_still_waiting_member_reports_no_unknown_ids() {
        let pool = PowerPool::new(PowerPool::builder().with_max_threads(1)).unwrap();
        // Pin the sole worker so neither group member gets a chance to start.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let g = gate.clone();
        pool.queue(
            Box::new(move |_ctl| {
                g.wait();
                Ok(Box::new(()) as BoxedValue)
            }),
            WorkOptions::new(),
            None,
        )
        .unwrap();

        for _ in 0..2 {
            pool.queue(Box::new(|_ctl| Ok(Box::new(()) as BoxedValue)), WorkOptions::new().with_group("batch"), None)
                .unwrap();
        }

        assert!(pool.group("batch").cancel().is_empty());
        assert!(pool.group("batch").members().is_empty());
        gate.wait();
    }

    #[test]
    fn pause_then_resume_releases_every_member() {
        let pool = PowerPool::new(PowerPool::builder().with_max_threads(1)).unwrap();
        // Pin the sole worker so pausing the group happens strictly before
        // either member has a chance to reach `pause_if_requested`.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let g = gate.clone();
        pool.queue(
            Box::new(move |_ctl| {
                g.wait();
                Ok(Box::new(()) as BoxedValue)
            }),
            WorkOptions::new(),
            None,
        )
        .unwrap();

        let unblocked = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let u = unblocked.clone();
            pool.queue(
                Box::new(move |ctl| {
                    ctl.pause_if_requested();
                    u.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(()) as BoxedValue)
                }),
                WorkOptions::new().with_group("batch"),
                None,
            )
            .unwrap();
        }

        assert!(pool.group("batch").pause().is_empty());
        gate.wait();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(unblocked.load(Ordering::SeqCst), 0, "paused members must not pass pause_if_requested");

        assert!(pool.group("batch").resume().is_empty());
        let deadline = Instant::now() + Duration::from_secs(2);
        while unblocked.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(unblocked.load(Ordering::SeqCst), 2);
    }
}
