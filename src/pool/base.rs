//! Bookkeeping shared by every pool flavour.
//!
//! [`PoolCore`] owns the thread counters, the scaling clock and the
//! cumulative timers. One mutex guards all of them and it is only held
//! for bookkeeping, never while a worker unit runs.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::metrics::Histogram;

use super::error::{PoolError, PoolResult, UnitResult};

/// Mutable pool state, guarded by [`PoolCore::lock`].
#[derive(Debug)]
pub(crate) struct CoreState {
    pub nb_threads: usize,
    pub nb_active: usize,
    pub init_threads: usize,
    pub max_threads: usize,
    pub last_change: Instant,
    pub active_time: Duration,
    pub idle_time: Duration,
    pub queue_time: Duration,
    pub processed: u64,
    pub total_processed: u64,
}

pub(crate) struct PoolCore {
    name: String,
    state: Mutex<CoreState>,
    drained: Condvar,
    stopped: AtomicBool,
    running: AtomicBool,
    next_thread_id: AtomicUsize,
}

impl PoolCore {
    pub fn new(name: impl Into<String>, init_threads: usize, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CoreState {
                nb_threads: 0,
                nb_active: 0,
                init_threads,
                max_threads,
                last_change: Instant::now(),
                active_time: Duration::ZERO,
                idle_time: Duration::ZERO,
                queue_time: Duration::ZERO,
                processed: 0,
                total_processed: 0,
            }),
            drained: Condvar::new(),
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            next_thread_id: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn nb_threads(&self) -> usize {
        self.lock().nb_threads
    }

    /// Whether the calling thread sits above the initial population.
    pub fn is_extra(&self) -> bool {
        let state = self.lock();
        state.nb_threads > state.init_threads
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Raise the stop flag. Returns false if it was already raised.
    pub fn request_stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark the pool as started. Returns false if it already was.
    pub fn mark_running(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Change the initial/maximum thread counts. Only allowed before `run()`.
    pub fn set_limits(&self, init_threads: usize, max_threads: usize) -> PoolResult<()> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning(self.name.clone()));
        }
        let mut state = self.lock();
        state.init_threads = init_threads;
        state.max_threads = max_threads;
        Ok(())
    }

    /// Count one more thread unconditionally (initial population).
    pub fn reserve_thread(&self) {
        let mut state = self.lock();
        state.nb_threads += 1;
    }

    /// Give back a thread slot and wake drain waiters.
    pub fn release_thread(&self) {
        let mut state = self.lock();
        state.nb_threads = state.nb_threads.saturating_sub(1);
        drop(state);
        self.drained.notify_all();
    }

    pub fn task_started(&self, idle: Duration) {
        let mut state = self.lock();
        state.nb_active += 1;
        state.idle_time += idle;
    }

    /// Account a finished task. Its queue time is added together with the
    /// processed count so the average never mixes in-flight tasks.
    pub fn task_finished(&self, active: Duration, queued: Duration) {
        let mut state = self.lock();
        state.nb_active = state.nb_active.saturating_sub(1);
        state.active_time += active;
        state.queue_time += queued;
        state.processed += 1;
        state.total_processed += 1;
    }

    /// Zero the per-interval accumulators after a metrics sample.
    pub fn reset_metrics(&self) {
        let mut state = self.lock();
        state.active_time = Duration::ZERO;
        state.idle_time = Duration::ZERO;
        state.queue_time = Duration::ZERO;
        state.processed = 0;
    }

    /// Block until no thread is left, or until `timeout` expires.
    ///
    /// A timeout too large to be represented waits without limit.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock();
        while state.nb_threads > 0 {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .drained
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self
                        .drained
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        true
    }

    /// Spawn a named thread for an already reserved slot.
    ///
    /// The slot is released again when the thread cannot be created.
    pub fn spawn<F>(self: &Arc<Self>, body: F) -> io::Result<()>
    where
        F: FnOnce(ThreadSlot) + Send + 'static,
    {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let slot = ThreadSlot {
            core: Arc::clone(self),
            released: false,
        };
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || body(slot));

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.release_thread();
                Err(e)
            }
        }
    }

    /// Start `count` threads one by one, waiting for each to report the
    /// outcome of its worker init before starting the next.
    pub fn start_population<F>(self: &Arc<Self>, count: usize, body: F) -> PoolResult<()>
    where
        F: Fn(ThreadSlot, SyncSender<Result<(), String>>) + Clone + Send + 'static,
    {
        for _ in 0..count {
            let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
            let body = body.clone();
            self.reserve_thread();
            self.spawn(move |slot| body(slot, ready_tx))
                .map_err(|source| PoolError::Spawn {
                    pool: self.name.clone(),
                    source,
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    return Err(PoolError::Init {
                        pool: self.name.clone(),
                        reason,
                    })
                }
                Err(_) => {
                    return Err(PoolError::Init {
                        pool: self.name.clone(),
                        reason: "thread exited during init".into(),
                    })
                }
            }
        }
        self.lock().last_change = Instant::now();
        Ok(())
    }

    /// Thread-level statistics for the metrics layer.
    ///
    /// The returned histogram reads this core's accumulators and resets
    /// them after every sample.
    pub fn histogram(self: &Arc<Self>) -> Histogram {
        let threads = Arc::clone(self);
        let load = Arc::clone(self);
        let activity = Arc::clone(self);
        let processing = Arc::clone(self);
        let reset = Arc::clone(self);

        Histogram::internal(self.name.clone())
            .with_gauge("Threads", "threads", move || threads.lock().nb_threads as f64)
            .with_gauge("LoadFactor", "ratio", move || {
                let state = load.lock();
                ratio(state.nb_active as f64, state.nb_threads as f64)
            })
            .with_gauge("ActivityFactor", "ratio", move || {
                let state = activity.lock();
                let active = state.active_time.as_secs_f64();
                ratio(active, active + state.idle_time.as_secs_f64())
            })
            .with_gauge("ProcessingTime", "ms", move || {
                let state = processing.lock();
                ratio(
                    state.active_time.as_secs_f64() * 1000.0,
                    state.processed as f64,
                )
            })
            .on_sample(move || reset.reset_metrics())
    }
}

/// `num / den`, or 0 when the denominator is 0.
pub(crate) fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Ownership of one counted thread.
///
/// Dropping the slot (thread exit, including unwinding) gives the count
/// back unless [`ThreadSlot::retired`] already did so under the lock.
pub(crate) struct ThreadSlot {
    core: Arc<PoolCore>,
    released: bool,
}

impl ThreadSlot {
    pub fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }

    /// Record that the count was decremented by a shrink decision.
    pub fn retired(mut self) {
        self.released = true;
        self.core.drained.notify_all();
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if !self.released {
            self.core.release_thread();
        }
    }
}

/// Run a worker unit callback, turning errors and panics into a message.
pub(crate) fn guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> UnitResult,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Per-thread timing carried across loop iterations.
pub(crate) struct ThreadClock {
    pub last_done: Instant,
}

impl ThreadClock {
    pub fn new() -> Self {
        Self {
            last_done: Instant::now(),
        }
    }
}
