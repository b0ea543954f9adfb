//! Error types for lattice-pool.

use crate::id::WorkId;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur at the pool's configuration and disposal
/// boundaries.
///
/// Per-work failures never surface here — they travel through
/// [`crate::events::PoolEvent::WorkEnd`] and the work's callback instead
/// (see the propagation policy in the crate docs).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `MinThreads` exceeded `MaxThreads` at construction time.
    #[error("the minimum number of threads ({min}) cannot be greater than the maximum number of threads ({max})")]
    InvalidThreadConfig {
        /// The configured minimum.
        min: usize,
        /// The configured maximum.
        max: usize,
    },

    /// A `CustomWorkID` collided with a work already live in the pool.
    #[error("work id '{0}' is already in use")]
    DuplicateWorkId(WorkId),

    /// An operation referenced a work id not present in the registry.
    #[error("unknown work id '{0}'")]
    UnknownWork(WorkId),

    /// The pool has already been disposed.
    #[error("operation attempted on a disposed pool")]
    PoolDisposed,
}

/// The outcome of executing a single work body.
#[derive(Debug)]
pub enum WorkOutcome<T> {
    /// The body returned a value.
    Succeeded(T),
    /// The body returned or panicked with an error.
    Failed(WorkError),
    /// The work was cooperatively stopped before completion.
    Stopped,
    /// The work never started because the pool or work was cancelled first.
    Cancelled,
}

/// The error captured when a work body fails, is forcibly interrupted, or
/// cooperatively exits early via [`crate::work::WorkControl::stop_if_requested`].
#[derive(Debug)]
pub enum WorkError {
    /// The body returned an application-level error.
    Body(Box<dyn std::error::Error + Send + Sync>),
    /// The body panicked.
    Panic(String),
    /// A forced stop interrupted the worker thread mid-execution.
    ForcedStop,
    /// The body exited via `stop_if_requested()`. The worker boundary
    /// always classifies this as a successful termination of the stop
    /// protocol (status `Stopped`), never `Failed` — this variant exists so
    /// a body can propagate it with `?` instead of throwing.
    StopRequested,
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Body(e) => write!(f, "work body failed: {e}"),
            Self::Panic(msg) => write!(f, "work body panicked: {msg}"),
            Self::ForcedStop => write!(f, "work was force-stopped"),
            Self::StopRequested => write!(f, "work stopped cooperatively"),
        }
    }
}

impl std::error::Error for WorkError {}
