//! Queue-fed pool whose thread count follows the load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{threshold_for, PoolConfig, MAX_THREADS_HARD_CAP};
use crate::metrics::MetricsCollector;

use super::base::{guarded, ratio, PoolCore, ThreadClock, ThreadSlot};
use super::error::{PoolError, PoolResult, PopError, PushError};
use super::queue::{Task, TaskQueue};
use super::{PoolStats, Producer, WorkerUnit, IDLE_POLL_INTERVAL};

/// State shared by the pool owner, its handles and its threads.
struct Shared<U: WorkerUnit> {
    core: Arc<PoolCore>,
    queue: TaskQueue<U::Task>,
    unit: Arc<U>,
    threshold_percent: u32,
    max_tasks: usize,
    scale_down_delay: Duration,
    producer: Mutex<Option<Arc<dyn Producer<U>>>>,
}

impl<U: WorkerUnit> Shared<U> {
    fn add_task(self: &Arc<Self>, payload: U::Task, wait: bool) -> Result<(), PushError<U::Task>> {
        if self.core.is_stopped() {
            return Err(PushError::Closed(payload));
        }
        self.queue.push(payload, wait)?;
        self.maybe_grow();
        Ok(())
    }

    /// Add one consumer thread if the backlog calls for it.
    ///
    /// The queue length is read outside the pool lock; a spawn too many or
    /// too few under contention is tolerated.
    fn maybe_grow(self: &Arc<Self>) {
        if self.core.is_stopped() || !self.core.is_running() {
            return;
        }

        let queued = self.queue.size();
        let reserved = {
            let mut state = self.core.lock();
            let threshold = threshold_for(
                state.init_threads,
                state.max_threads,
                self.threshold_percent,
                self.max_tasks,
            );
            if state.nb_threads < state.max_threads
                && (state.nb_threads == 0 || queued > threshold)
            {
                state.nb_threads += 1;
                state.last_change = Instant::now();
                true
            } else {
                false
            }
        };

        if !reserved {
            return;
        }

        let shared = Arc::clone(self);
        match self
            .core
            .spawn(move |slot| consumer_main(shared, slot, None))
        {
            Ok(()) => debug!(
                pool = %self.core.name(),
                threads = self.core.nb_threads(),
                queued,
                "thread added"
            ),
            Err(e) => warn!(
                pool = %self.core.name(),
                error = %e,
                queued,
                "failed to add thread"
            ),
        }
    }

    /// Shrink decision, taken under the pool lock so concurrent threads
    /// can never retire below the initial population.
    fn try_retire(&self) -> bool {
        let queued = self.queue.size();
        let mut state = self.core.lock();
        let threshold = threshold_for(
            state.init_threads,
            state.max_threads,
            self.threshold_percent,
            self.max_tasks,
        );
        if queued < threshold
            && state.nb_threads > state.init_threads
            && state.last_change.elapsed() > self.scale_down_delay
        {
            state.nb_threads -= 1;
            state.last_change = Instant::now();
            true
        } else {
            false
        }
    }

    fn process(&self, task: Task<U::Task>, clock: &mut ThreadClock) {
        let started = Instant::now();
        let queued = started.saturating_duration_since(task.queued_at);
        self.core
            .task_started(started.saturating_duration_since(clock.last_done));

        if let Err(e) = guarded(|| self.unit.run(task.payload)) {
            error!(
                pool = %self.core.name(),
                pending = self.queue.size(),
                error = %e,
                "task failed"
            );
        }

        let done = Instant::now();
        self.core
            .task_finished(done.saturating_duration_since(started), queued);
        clock.last_done = done;
    }

    fn request_shutdown(&self) {
        if !self.core.request_stop() {
            return;
        }
        info!(
            pool = %self.core.name(),
            pending = self.queue.size(),
            threads = self.core.nb_threads(),
            "shutting down pool"
        );

        let producer = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(producer) = producer {
            producer.stop();
        }
        self.queue.terminate();
    }

    /// No consumer thread can ever exist: the producer runs every task
    /// itself.
    fn is_inline(&self) -> bool {
        self.core.lock().max_threads == 0
    }

    fn has_producer(&self) -> bool {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether every accepted task was handed to a worker unit.
    fn is_drained(&self) -> bool {
        self.core.nb_threads() == 0 && self.queue.size() == 0
    }

    fn backlog_factor(&self) -> f64 {
        ratio(self.queue.size() as f64, self.queue.capacity() as f64)
    }

    fn average_queuing_time(&self) -> Duration {
        let state = self.core.lock();
        if state.processed == 0 {
            return Duration::ZERO;
        }
        state.queue_time / state.processed.min(u64::from(u32::MAX)) as u32
    }

    fn stats(&self) -> PoolStats {
        let pending_tasks = self.queue.size();
        let state = self.core.lock();
        PoolStats {
            name: self.core.name().to_string(),
            threads: state.nb_threads,
            active_threads: state.nb_active,
            init_threads: state.init_threads,
            max_threads: state.max_threads,
            pending_tasks,
            capacity: self.queue.capacity(),
            processed_tasks: state.total_processed,
        }
    }
}

/// Body of every consumer thread.
fn consumer_main<U: WorkerUnit>(
    shared: Arc<Shared<U>>,
    slot: ThreadSlot,
    ready: Option<SyncSender<Result<(), String>>>,
) {
    let init = guarded(|| shared.unit.init());
    let init_ok = init.is_ok();
    match ready {
        Some(ready) => {
            let _ = ready.send(init);
        }
        None => {
            if let Err(e) = init {
                error!(pool = %shared.core.name(), error = %e, "worker init failed on added thread");
            }
        }
    }
    if !init_ok {
        return;
    }

    debug!(pool = %shared.core.name(), "worker thread started");
    let mut clock = ThreadClock::new();

    let retired = loop {
        let extra = shared.core.is_extra();
        match shared.queue.pop(extra) {
            Ok(task) => {
                shared.process(task, &mut clock);
                if shared.try_retire() {
                    break true;
                }
            }
            Err(PopError::WouldBlock) => {
                if shared.try_retire() {
                    break true;
                }
                thread::sleep(IDLE_POLL_INTERVAL);
            }
            Err(PopError::Closed) => break false,
        }
    };

    stop_unit(&shared);

    if retired {
        slot.retired();
        debug!(
            pool = %shared.core.name(),
            threads = shared.core.nb_threads(),
            "idle thread retired"
        );
    } else {
        drop(slot);
        debug!(pool = %shared.core.name(), "worker thread stopped");
    }
}

/// Run the unit's `stop()` hook, logging a panic.
fn stop_unit<U: WorkerUnit>(shared: &Shared<U>) {
    if let Err(e) = guarded(|| {
        shared.unit.stop();
        Ok(())
    }) {
        warn!(pool = %shared.core.name(), error = %e, "worker stop failed");
    }
}

/// Cloneable handle used by producers and worker units to reach their pool.
pub struct PoolHandle<U: WorkerUnit> {
    shared: Arc<Shared<U>>,
}

impl<U: WorkerUnit> Clone for PoolHandle<U> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<U: WorkerUnit> PoolHandle<U> {
    /// Queue a task; see [`DynamicPool::add_task`].
    pub fn add_task(&self, payload: U::Task, wait: bool) -> Result<(), PushError<U::Task>> {
        self.shared.add_task(payload, wait)
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn nb_threads(&self) -> usize {
        self.shared.core.nb_threads()
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Queue length relative to the queue capacity.
    pub fn backlog_factor(&self) -> f64 {
        self.shared.backlog_factor()
    }

    /// Mean time tasks waited in the queue since the last metrics sample.
    pub fn average_queuing_time(&self) -> Duration {
        self.shared.average_queuing_time()
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.core.is_stopped()
    }

    /// Whether the pool has no consumer threads and its producer must run
    /// the unit on its own thread (`max_threads == 0`). The unit is then
    /// initialized by `run()` and stopped when the producer returns.
    pub fn is_inline(&self) -> bool {
        self.shared.is_inline()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Start shutting the pool down without waiting.
    ///
    /// Safe to call from a worker unit or the producer of this pool.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// The unit run by this pool's threads.
    pub(crate) fn unit(&self) -> &Arc<U> {
        &self.shared.unit
    }
}

/// Pool of consumer threads fed through a bounded queue.
///
/// `run()` starts `init_threads` consumers. Each [`add_task`](Self::add_task)
/// that leaves the queue longer than the threshold adds one thread, up to
/// `max_threads`. Threads above the initial population retire once the
/// backlog is below the threshold and no scaling change happened for the
/// scale-down delay.
pub struct DynamicPool<U: WorkerUnit> {
    shared: Arc<Shared<U>>,
    collector: Option<Arc<MetricsCollector>>,
    initialized: AtomicBool,
    producer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<U: WorkerUnit> DynamicPool<U> {
    /// Create a pool. Nothing runs before [`run`](Self::run).
    pub fn new(config: PoolConfig, unit: Arc<U>) -> PoolResult<Self> {
        config.validate()?;

        let core = Arc::new(PoolCore::new(
            config.name.clone(),
            config.init_threads,
            config.max_threads,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                core,
                queue: TaskQueue::new(config.max_tasks),
                unit,
                threshold_percent: config.threshold_percent,
                max_tasks: config.max_tasks,
                scale_down_delay: config.scale_down_delay,
                producer: Mutex::new(None),
            }),
            collector: None,
            initialized: AtomicBool::new(false),
            producer_thread: Mutex::new(None),
        })
    }

    /// Attach the producer run on a dedicated thread by `run()`.
    pub fn with_producer<P: Producer<U>>(self, producer: P) -> Self {
        *self
            .shared
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(producer));
        self
    }

    /// Publish this pool's counters through `collector` once initialized.
    pub fn with_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn handle(&self) -> PoolHandle<U> {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Set the initial thread count, raising the maximum if needed.
    /// Only allowed before `run()`.
    pub fn set_nb_threads(&self, nb_threads: usize) -> PoolResult<()> {
        if nb_threads > MAX_THREADS_HARD_CAP {
            return Err(PoolError::InvalidConfig(format!(
                "{} threads exceed the hard cap of {}",
                nb_threads, MAX_THREADS_HARD_CAP
            )));
        }
        let max = self.shared.core.lock().max_threads.max(nb_threads);
        self.shared.core.set_limits(nb_threads, max)
    }

    /// Register metrics. Called by `run()` if not done explicitly.
    pub fn init(&self) -> PoolResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(collector) = &self.collector {
            let backlog = self.handle();
            let queuing = self.handle();
            let histogram = self
                .shared
                .core
                .histogram()
                .with_gauge("BacklogFactor", "ratio", move || backlog.backlog_factor())
                .with_gauge("QueuingTime", "ms", move || {
                    queuing.average_queuing_time().as_secs_f64() * 1000.0
                });
            collector.add_histogram(histogram);
        }
        Ok(())
    }

    /// Start the initial population and the producer.
    ///
    /// A failure to start any initial thread (spawn or worker init) stops
    /// the pool and is returned. With `max_threads == 0` the unit is
    /// initialized here, on the calling thread, and the pool needs a
    /// producer to run its tasks.
    pub fn run(&self) -> PoolResult<()> {
        if !self.shared.core.mark_running() {
            return Err(PoolError::AlreadyRunning(self.name().to_string()));
        }
        self.init()?;

        let (init_threads, max_threads) = {
            let state = self.shared.core.lock();
            (state.init_threads, state.max_threads)
        };

        let inline = max_threads == 0;
        if inline {
            if !self.shared.has_producer() {
                self.abort_startup();
                return Err(PoolError::InvalidConfig(format!(
                    "pool {} has no thread and no producer to run its tasks",
                    self.name()
                )));
            }
            if let Err(reason) = guarded(|| self.shared.unit.init()) {
                let e = PoolError::Init {
                    pool: self.name().to_string(),
                    reason,
                };
                error!(pool = %self.name(), error = %e, "pool startup failed");
                self.abort_startup();
                return Err(e);
            }
        }

        let shared = Arc::clone(&self.shared);
        let started = self
            .shared
            .core
            .start_population(init_threads, move |slot, ready| {
                consumer_main(Arc::clone(&shared), slot, Some(ready))
            });

        if let Err(e) = started {
            error!(pool = %self.name(), error = %e, "pool startup failed");
            self.abort_startup();
            return Err(e);
        }

        if let Err(e) = self.start_producer(inline) {
            error!(pool = %self.name(), error = %e, "pool startup failed");
            if inline {
                stop_unit(&self.shared);
            }
            self.abort_startup();
            return Err(e);
        }

        info!(
            pool = %self.name(),
            threads = init_threads,
            max_threads,
            capacity = self.shared.queue.capacity(),
            threshold = threshold_for(
                init_threads,
                max_threads,
                self.shared.threshold_percent,
                self.shared.max_tasks
            ),
            "pool started"
        );
        Ok(())
    }

    fn start_producer(&self, inline: bool) -> PoolResult<()> {
        let producer = self
            .shared
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(producer) = producer else {
            return Ok(());
        };

        let handle = self.handle();
        let spawned = thread::Builder::new()
            .name(format!("{}-producer", self.name()))
            .spawn(move || {
                match guarded(|| producer.produce(&handle)) {
                    Ok(()) => debug!(pool = %handle.name(), "producer finished"),
                    Err(e) => error!(pool = %handle.name(), error = %e, "producer failed"),
                }
                if inline {
                    stop_unit(&handle.shared);
                }
            })
            .map_err(|source| PoolError::Spawn {
                pool: self.name().to_string(),
                source,
            })?;

        *self
            .producer_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(spawned);
        Ok(())
    }

    fn abort_startup(&self) {
        self.shared.request_shutdown();
        if !self.shared.core.wait_drained(Some(Duration::from_secs(5))) {
            warn!(pool = %self.name(), "threads still running after failed startup");
        }
    }

    /// Queue a task.
    ///
    /// With `wait` the call blocks while the queue is full. The task is
    /// handed back in [`PushError::Full`] (non-blocking push on a full
    /// queue) or [`PushError::Closed`] (pool terminating).
    pub fn add_task(&self, payload: U::Task, wait: bool) -> Result<(), PushError<U::Task>> {
        self.shared.add_task(payload, wait)
    }

    pub fn nb_threads(&self) -> usize {
        self.shared.core.nb_threads()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Stop the pool.
    ///
    /// Queued tasks are still processed. With `wait`, blocks until every
    /// consumer exited and the producer returned. Returns whether the pool
    /// is fully drained. Idempotent.
    pub fn shutdown(&self, wait: bool) -> bool {
        self.shared.request_shutdown();
        if !wait {
            return self.shared.is_drained();
        }

        self.shared.core.wait_drained(None);
        self.join_producer(None);
        let drained = self.report_drain();
        info!(pool = %self.name(), "pool stopped");
        drained
    }

    /// Like `shutdown(true)` but gives up after `timeout`.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        self.shared.request_shutdown();
        let threads_done = self.shared.core.wait_drained(Some(timeout));
        let producer_done = self.join_producer(deadline);
        if !threads_done {
            warn!(
                pool = %self.name(),
                threads = self.nb_threads(),
                "pool did not drain in time"
            );
            return false;
        }
        self.report_drain() && producer_done
    }

    /// Check that no queued task was left behind by the exited threads.
    fn report_drain(&self) -> bool {
        let left = self.shared.queue.size();
        if left > 0 && self.shared.core.nb_threads() == 0 {
            warn!(
                pool = %self.name(),
                pending = left,
                "pool stopped with unprocessed tasks"
            );
        }
        self.shared.is_drained()
    }

    /// Reap the producer thread. Returns false if it is still running at
    /// `deadline`.
    fn join_producer(&self, deadline: Option<Instant>) -> bool {
        let mut slot = self
            .producer_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = slot.take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            return true;
        }

        if let Some(deadline) = deadline {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    *slot = Some(handle);
                    return false;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        if handle.join().is_err() {
            warn!(pool = %self.name(), "producer thread panicked");
        }
        true
    }
}

impl<U: WorkerUnit> Drop for DynamicPool<U> {
    fn drop(&mut self) {
        self.shared.request_shutdown();
    }
}
