//! Error types

use thiserror::Error;

/// Errors returned to callers of the queue, cleaner and context APIs
#[derive(Debug, Error)]
pub enum RefError {
    /// A timed wait was requested with a negative timeout.
    #[error("timeout must not be negative, got {0} ms")]
    NegativeTimeout(i64),

    /// A blocked `remove` was woken by `interrupt_waiters`.
    #[error("wait on reference queue was interrupted")]
    Interrupted,

    /// Registration was attempted for a target that is already gone.
    #[error("target has no strong references left")]
    DeadTarget,

    /// A background thread could not be started.
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by a [`PendingSource`](crate::PendingSource)
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The source shut down; the dispatcher exits after draining.
    #[error("pending source closed")]
    Closed,

    /// The source broke. Fatal to the dispatcher.
    #[error("pending source failed: {0}")]
    Failed(String),
}
