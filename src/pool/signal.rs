//! Pool whose threads run on notification or on a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::MAX_THREADS_HARD_CAP;
use crate::metrics::MetricsCollector;

use super::base::{guarded, PoolCore, ThreadClock, ThreadSlot};
use super::error::{PoolError, PoolResult};
use super::{PoolStats, WorkerUnit};

/// Why [`Notifier::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// [`Notifier::notify`] was called since the last wake-up.
    Notified,
    /// The timeout expired without a notification.
    TimedOut,
    /// The stop predicate became true.
    Stopped,
}

/// Condition variable with a generation counter.
///
/// A notification is never lost: waiters compare the generation against
/// the one they last saw, so a `notify()` issued while no thread is waiting
/// is picked up by the next `wait()`.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake waiters so they re-check their stop predicate.
    pub(crate) fn wake_all(&self) {
        let _guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Wait for a notification newer than `seen`, at most `timeout`.
    ///
    /// `stop` is checked before sleeping and on every wake-up, and wins
    /// over a pending notification.
    pub fn wait(&self, seen: &mut u64, timeout: Duration, stop: impl Fn() -> bool) -> Wake {
        // No deadline when `timeout` does not fit in an Instant.
        let deadline = Instant::now().checked_add(timeout);
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if stop() {
                return Wake::Stopped;
            }
            if *generation != *seen {
                *seen = *generation;
                return Wake::Notified;
            }
            generation = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::TimedOut;
                    }
                    self.cond
                        .wait_timeout(generation, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .cond
                    .wait(generation)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// Cloneable handle to a running [`SignalPool`].
#[derive(Clone)]
pub struct SignalHandle {
    core: Arc<PoolCore>,
    notifier: Arc<Notifier>,
}

impl SignalHandle {
    /// Wake the pool's threads for an immediate run.
    pub fn notify(&self) {
        self.notifier.notify();
    }

    /// Stop the pool without waiting for its threads.
    pub fn request_shutdown(&self) {
        request_stop(&self.core, &self.notifier);
    }

    pub fn is_terminating(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }
}

fn request_stop(core: &PoolCore, notifier: &Notifier) {
    if core.request_stop() {
        info!(pool = %core.name(), threads = core.nb_threads(), "shutting down pool");
    }
    notifier.wake_all();
}

struct SignalContext<U> {
    core: Arc<PoolCore>,
    unit: Arc<U>,
    notifier: Arc<Notifier>,
    interval: Duration,
}

impl<U> Clone for SignalContext<U> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            unit: Arc::clone(&self.unit),
            notifier: Arc::clone(&self.notifier),
            interval: self.interval,
        }
    }
}

fn signal_main<U: WorkerUnit<Task = ()>>(
    ctx: SignalContext<U>,
    slot: ThreadSlot,
    ready: SyncSender<Result<(), String>>,
) {
    // Notifications issued during init are kept for the first wait.
    let mut seen = ctx.notifier.generation();

    let init = guarded(|| ctx.unit.init());
    let init_ok = init.is_ok();
    let _ = ready.send(init);
    if !init_ok {
        return;
    }

    debug!(pool = %ctx.core.name(), "signal thread started");
    let mut clock = ThreadClock::new();

    loop {
        match ctx
            .notifier
            .wait(&mut seen, ctx.interval, || ctx.core.is_stopped())
        {
            Wake::Stopped => break,
            Wake::Notified | Wake::TimedOut => {}
        }

        let started = Instant::now();
        ctx.core
            .task_started(started.saturating_duration_since(clock.last_done));
        if let Err(e) = guarded(|| ctx.unit.run(())) {
            error!(pool = %ctx.core.name(), error = %e, "periodic run failed");
        }
        let done = Instant::now();
        ctx.core.task_finished(done.saturating_duration_since(started), Duration::ZERO);
        clock.last_done = done;
    }

    if let Err(e) = guarded(|| {
        ctx.unit.stop();
        Ok(())
    }) {
        warn!(pool = %ctx.core.name(), error = %e, "worker stop failed");
    }
    drop(slot);
    debug!(pool = %ctx.core.name(), "signal thread stopped");
}

/// Fixed-size pool running its unit when notified or every `interval`.
///
/// Typical use is a periodic job that can also be triggered on demand,
/// such as a metrics collector flushed on `SIGUSR1`.
pub struct SignalPool<U: WorkerUnit<Task = ()>> {
    core: Arc<PoolCore>,
    unit: Arc<U>,
    notifier: Arc<Notifier>,
    interval: Duration,
    collector: Option<Arc<MetricsCollector>>,
    initialized: AtomicBool,
}

impl<U: WorkerUnit<Task = ()>> SignalPool<U> {
    /// Create a one-thread pool. Nothing runs before [`run`](Self::run).
    pub fn new(name: impl Into<String>, unit: Arc<U>, interval: Duration) -> Self {
        Self {
            core: Arc::new(PoolCore::new(name, 1, 1)),
            unit,
            notifier: Arc::new(Notifier::new()),
            interval,
            collector: None,
            initialized: AtomicBool::new(false),
        }
    }

    /// Share a notifier with other pools or with signal handlers.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_threads(self, nb_threads: usize) -> PoolResult<Self> {
        self.set_nb_threads(nb_threads)?;
        Ok(self)
    }

    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Only allowed before `run()`.
    pub fn set_nb_threads(&self, nb_threads: usize) -> PoolResult<()> {
        if nb_threads > MAX_THREADS_HARD_CAP {
            return Err(PoolError::InvalidConfig(format!(
                "{} threads exceed the hard cap of {}",
                nb_threads, MAX_THREADS_HARD_CAP
            )));
        }
        self.core.set_limits(nb_threads, nb_threads)
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn handle(&self) -> SignalHandle {
        SignalHandle {
            core: Arc::clone(&self.core),
            notifier: Arc::clone(&self.notifier),
        }
    }

    /// Register metrics. Called by `run()` if not done explicitly.
    pub fn init(&self) -> PoolResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(collector) = &self.collector {
            collector.add_histogram(self.core.histogram());
        }
        Ok(())
    }

    /// Start the threads, each waiting for its first notification or
    /// timeout.
    pub fn run(&self) -> PoolResult<()> {
        if !self.core.mark_running() {
            return Err(PoolError::AlreadyRunning(self.name().to_string()));
        }
        self.init()?;

        let nb_threads = self.core.lock().init_threads;
        let ctx = SignalContext {
            core: Arc::clone(&self.core),
            unit: Arc::clone(&self.unit),
            notifier: Arc::clone(&self.notifier),
            interval: self.interval,
        };

        if let Err(e) = self
            .core
            .start_population(nb_threads, move |slot, ready| {
                signal_main(ctx.clone(), slot, ready)
            })
        {
            error!(pool = %self.name(), error = %e, "pool startup failed");
            request_stop(&self.core, &self.notifier);
            self.core.wait_drained(Some(Duration::from_secs(5)));
            return Err(e);
        }

        info!(
            pool = %self.name(),
            threads = nb_threads,
            interval_secs = self.interval.as_secs_f64(),
            "pool started"
        );
        Ok(())
    }

    /// Wake the threads for an immediate run.
    pub fn notify(&self) {
        self.notifier.notify();
    }

    pub fn nb_threads(&self) -> usize {
        self.core.nb_threads()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.core.lock();
        PoolStats {
            name: self.name().to_string(),
            threads: state.nb_threads,
            active_threads: state.nb_active,
            init_threads: state.init_threads,
            max_threads: state.max_threads,
            pending_tasks: 0,
            capacity: 0,
            processed_tasks: state.total_processed,
        }
    }

    /// Stop the threads. A run in progress completes first.
    ///
    /// Returns whether every thread has exited. Idempotent.
    pub fn shutdown(&self, wait: bool) -> bool {
        request_stop(&self.core, &self.notifier);
        if wait {
            self.core.wait_drained(None)
        } else {
            self.core.nb_threads() == 0
        }
    }

    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        request_stop(&self.core, &self.notifier);
        self.core.wait_drained(Some(timeout))
    }
}

impl<U: WorkerUnit<Task = ()>> Drop for SignalPool<U> {
    fn drop(&mut self) {
        request_stop(&self.core, &self.notifier);
    }
}
