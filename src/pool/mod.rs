//! Worker pool infrastructure.
//!
//! Daemons hand work to pools of OS threads. Every pool runs a caller
//! supplied [`WorkerUnit`]; the flavour of pool decides when the unit runs.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      DynamicPool                           │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐                                              │
//! │  │ Producer │ (optional, e.g. accept loop)                 │
//! │  └────┬─────┘                                              │
//! │       │ add_task()                                         │
//! │  ┌────▼──────────┐   grows above threshold,                │
//! │  │   TaskQueue   │   shrinks after the scale-down delay    │
//! │  └────┬──────────┘                                         │
//! │       │ pop()                                              │
//! │  ┌────▼────┐    ┌─────────┐    ┌─────────┐                 │
//! │  │ Worker1 │    │ Worker2 │    │ WorkerN │  init..maxThreads│
//! │  └─────────┘    └─────────┘    └─────────┘                 │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SignalPool`] has no queue: its threads run the unit when notified or
//! when a timeout expires.

mod base;
mod dynamic;
mod error;
mod queue;
mod signal;

pub use dynamic::{DynamicPool, PoolHandle};
pub use error::{PoolError, PoolResult, PopError, PushError, UnitError, UnitResult};
pub use queue::{Task, TaskQueue};
pub use signal::{Notifier, SignalHandle, SignalPool, Wake};

pub(crate) use base::guarded;

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

/// Sleep of an extra thread that found the queue empty.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pluggable work executed by pool threads.
///
/// Each pool thread calls [`init`](Self::init) once, then
/// [`run`](Self::run) for every task, then [`stop`](Self::stop) once.
/// The unit is shared by all threads of a pool.
pub trait WorkerUnit: Send + Sync + 'static {
    /// The payload handed to `run`.
    type Task: Send + 'static;

    /// Prepare the calling thread. An error during pool startup aborts it.
    ///
    /// A pool without consumer threads calls it once from `run()`.
    fn init(&self) -> UnitResult {
        Ok(())
    }

    /// Process one task. Errors and panics are logged by the pool.
    fn run(&self, task: Self::Task) -> UnitResult;

    /// Best-effort cleanup when the thread exits.
    fn stop(&self) {}
}

/// Long-running unit feeding a [`DynamicPool`] from its own thread.
pub trait Producer<U: WorkerUnit>: Send + Sync + 'static {
    /// Loop until stopped, pushing tasks through `pool`.
    fn produce(&self, pool: &PoolHandle<U>) -> UnitResult;

    /// Ask a running [`produce`](Self::produce) call to return.
    fn stop(&self) {}
}

/// Adapts a closure to [`WorkerUnit`].
///
/// # Examples
///
/// ```
/// use taskpool::pool::{FnUnit, WorkerUnit};
///
/// let unit = FnUnit::new(|n: u32| {
///     if n == 0 {
///         return Err("zero".into());
///     }
///     Ok(())
/// });
/// assert!(unit.run(1).is_ok());
/// assert!(unit.run(0).is_err());
/// ```
pub struct FnUnit<T, F> {
    handler: F,
    _task: PhantomData<fn(T)>,
}

impl<T, F> FnUnit<T, F>
where
    F: Fn(T) -> UnitResult + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _task: PhantomData,
        }
    }
}

impl<T, F> WorkerUnit for FnUnit<T, F>
where
    F: Fn(T) -> UnitResult + Send + Sync + 'static,
    T: Send + 'static,
{
    type Task = T;

    fn run(&self, task: T) -> UnitResult {
        (self.handler)(task)
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Current number of threads.
    pub threads: usize,
    /// Threads currently running a task.
    pub active_threads: usize,
    /// Configured initial thread count.
    pub init_threads: usize,
    /// Configured maximum thread count.
    pub max_threads: usize,
    /// Tasks waiting in the queue.
    pub pending_tasks: usize,
    /// Queue capacity (0 for pools without a queue).
    pub capacity: usize,
    /// Tasks processed since the pool started.
    pub processed_tasks: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} threads busy ({}..{}), {}/{} queued, {} processed",
            self.name,
            self.active_threads,
            self.threads,
            self.init_threads,
            self.max_threads,
            self.pending_tasks,
            self.capacity,
            self.processed_tasks
        )
    }
}
