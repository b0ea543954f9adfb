//! Observable pool and work lifecycle events.
//!
//! Event delivery is modeled on this codebase's signal/slot convention
//! (`connect` registers a subscriber, `emit` invokes all of them) but
//! simplified to direct, same-thread invocation: there is no UI event loop
//! for this crate to queue deliveries onto, so every subscriber runs
//! synchronously on whichever thread raised the event — the calling
//! thread for `PoolStart`/`PoolIdle`, or the owning worker's thread for
//! `WorkStart`/`WorkEnd`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::id::WorkId;

thread_local! {
    /// Guards against a panicking `Error` subscriber re-entering `emit`
    /// and recursing forever.
    static REPORTING_ERROR: Cell<bool> = const { Cell::new(false) };
}

/// The terminal status of a work, reported in [`PoolEvent::WorkEnd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Succeeded,
    Failed,
    Stopped,
    Cancelled,
}

/// A lifecycle event raised by the pool or one of its works.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The pool transitioned from `NotRunning` to `Running`.
    PoolStart,
    /// The pool has no running or waiting work and returned to `NotRunning`.
    PoolIdle,
    /// No worker freed up within the pool-wide timeout.
    PoolTimeout,
    /// A work began executing on a worker.
    WorkStart(WorkId),
    /// A work reached a terminal state.
    WorkEnd {
        id: WorkId,
        status: WorkStatus,
        error: Option<Arc<str>>,
        queue_time: Duration,
        execute_time: Duration,
    },
    /// A work's timeout elapsed.
    WorkTimeout(WorkId),
    /// A work was cooperatively or forcibly stopped.
    WorkStop(WorkId),
    /// A subscriber, or a piece of pool bookkeeping, failed. Never
    /// propagated as a panic or `Result` error — always delivered here.
    Error { source: Arc<str>, error: Arc<str> },
}

type Subscriber = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// A multi-subscriber fan-out for [`PoolEvent`]s.
///
/// Subscriber panics are caught, logged, and reported via a synthetic
/// [`PoolEvent::Error`] rather than propagated to the caller that triggered
/// the original event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    /// Register a subscriber invoked for every event. Returns nothing to
    /// unsubscribe with — subscriptions live for the pool's lifetime, as
    /// in the source design's observer registration model.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Arc::new(f));
    }

    /// Raise an event, invoking every subscriber in registration order.
    ///
    /// A panicking subscriber never stops the fan-out and never propagates
    /// to the caller; it is logged and, once this event has finished
    /// reaching every subscriber, reported as a separate
    /// [`PoolEvent::Error`].
    pub fn emit(&self, event: PoolEvent) {
        let subscribers = self.subscribers.lock().clone();
        let mut panics = Vec::new();
        for subscriber in &subscribers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
            if let Err(panic) = result {
                panics.push(panic_message(&panic));
            }
        }
        for message in panics {
            tracing::error!(target: crate::logging::targets::DISPATCH, %message, "event subscriber panicked");
            self.report_error("event_subscriber", message);
        }
    }

    /// Emit a [`PoolEvent::Error`] without risking infinite recursion if an
    /// `Error` subscriber itself panics.
    pub fn report_error(&self, source: impl Into<Arc<str>>, error: impl Into<Arc<str>>) {
        let already_reporting = REPORTING_ERROR.with(|flag| flag.replace(true));
        if already_reporting {
            return;
        }
        self.emit(PoolEvent::Error { source: source.into(), error: error.into() });
        REPORTING_ERROR.with(|flag| flag.set(false));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.subscribe(move |_e| o1.lock().push(1));
        let o2 = order.clone();
        bus.subscribe(move |_e| o2.lock().push(2));
        bus.emit(PoolEvent::PoolStart);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_fanout_or_propagate() {
        let bus = EventBus::new();
        let pool_idle_calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_e| panic!("boom"));
        let c = pool_idle_calls.clone();
        bus.subscribe(move |e| {
            if matches!(e, PoolEvent::PoolIdle) {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        // Must not panic in this thread despite a subscriber panicking.
        bus.emit(PoolEvent::PoolIdle);
        assert_eq!(pool_idle_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_panic_is_reported_as_error_event() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        bus.subscribe(move |event| {
            if matches!(event, PoolEvent::Error { .. }) {
                e.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.subscribe(|_e| panic!("boom"));
        bus.emit(PoolEvent::PoolStart);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
