//! Tracing instrumentation constants for lattice-pool.
//!
//! The crate instruments itself with [`tracing`] spans and events rather
//! than printing directly, so an embedding application can filter, route,
//! or silence pool diagnostics with its own subscriber.

/// Span names used throughout lattice-pool. Useful for filtering traces to
/// a specific subsystem.
pub mod span_names {
    /// Span entered for the lifetime of a single work execution.
    pub const WORK: &str = "lattice_pool::work";
    /// Span entered for the lifetime of a worker thread's run loop.
    pub const WORKER: &str = "lattice_pool::worker";
}

/// Target names for log filtering with `tracing` directives.
pub mod targets {
    /// Pool state machine and dispatch decisions.
    pub const POOL: &str = "lattice_pool::pool";
    /// Worker lifecycle and execution.
    pub const WORKER: &str = "lattice_pool::worker";
    /// Dependency gating and group operations.
    pub const DISPATCH: &str = "lattice_pool::dispatch";
}
