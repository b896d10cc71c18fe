//! Worker pool error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Error returned by a worker unit.
pub type UnitError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for worker unit callbacks.
pub type UnitResult = Result<(), UnitError>;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A thread of the initial population could not be created.
    #[error("pool {pool}: failed to spawn thread: {source}")]
    Spawn {
        pool: String,
        #[source]
        source: io::Error,
    },

    /// A worker unit refused to initialize on one of the initial threads.
    #[error("pool {pool}: worker init failed: {reason}")]
    Init { pool: String, reason: String },

    /// The task queue is full.
    #[error("queue full: {pending}/{capacity} pending tasks")]
    QueueFull {
        /// Maximum queue capacity.
        capacity: usize,
        /// Current number of pending tasks.
        pending: usize,
    },

    /// The pool is shutting down or has been shut down.
    #[error("pool is terminating")]
    Terminating,

    /// The pool configuration violates an invariant.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The operation is only allowed before `run()`.
    #[error("pool {0} is already running")]
    AlreadyRunning(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    /// Check if this is a queue full error.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, PoolError::QueueFull { .. })
    }

    /// Check if this is a terminating error.
    pub fn is_terminating(&self) -> bool {
        matches!(self, PoolError::Terminating)
    }

    /// Check if this error aborted the pool startup.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            PoolError::Spawn { .. } | PoolError::Init { .. } | PoolError::Bind { .. }
        )
    }
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// A task that could not be pushed, handed back to the caller.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum PushError<T> {
    /// Non-blocking push on a full queue.
    Full(T),
    /// The queue has been terminated.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected task.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(task) | PushError::Closed(task) => task,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue full"),
            PushError::Closed(_) => f.write_str("queue closed"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Reasons a pop returned without a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    /// Non-blocking pop on an empty queue.
    #[error("would block")]
    WouldBlock,
    /// The queue has been terminated and drained.
    #[error("queue closed")]
    Closed,
}
