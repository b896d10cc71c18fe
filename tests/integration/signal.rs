//! Signal pools: periodic and on-demand runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskpool::pool::{FnUnit, Notifier, SignalHandle, SignalPool, UnitResult, WorkerUnit};

use crate::helpers::*;

/// Records when each run happened.
struct Recorder {
    runs: Mutex<Vec<Instant>>,
    busy_for: Duration,
}

impl Recorder {
    fn new(busy_for: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(Vec::new()),
            busy_for,
        })
    }

    fn count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

impl WorkerUnit for Recorder {
    type Task = ();

    fn run(&self, _: ()) -> UnitResult {
        self.runs.lock().unwrap().push(Instant::now());
        thread::sleep(self.busy_for);
        Ok(())
    }
}

#[test]
fn test_notify_preempts_interval() {
    let recorder = Recorder::new(Duration::ZERO);
    let pool = SignalPool::new("hunter", Arc::clone(&recorder), Duration::from_secs(3600));
    pool.run().unwrap();

    let before = Instant::now();
    pool.notify();
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    assert!(before.elapsed() < Duration::from_secs(5));
    assert!(pool.shutdown(true));
}

/// A notify issued while the unit is busy triggers one more run afterwards.
#[test]
fn test_notify_while_busy_is_not_lost() {
    let recorder = Recorder::new(Duration::from_millis(200));
    let pool = SignalPool::new("busy", Arc::clone(&recorder), Duration::from_secs(3600));
    pool.run().unwrap();

    pool.notify();
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));
    pool.notify();
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 2));
    assert!(pool.shutdown(true));
}

#[test]
fn test_runs_at_least_every_interval() {
    let recorder = Recorder::new(Duration::ZERO);
    let pool = SignalPool::new("cleaner", Arc::clone(&recorder), Duration::from_millis(50));
    pool.run().unwrap();

    assert!(wait_until(Duration::from_secs(5), || recorder.count() >= 4));
    assert!(pool.shutdown(true));

    let runs = recorder.runs.lock().unwrap();
    for pair in runs.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(40));
    }
}

/// Shutdown lets a run in progress finish.
#[test]
fn test_shutdown_waits_for_running_unit() {
    let recorder = Recorder::new(Duration::from_millis(300));
    let pool = SignalPool::new("slow", Arc::clone(&recorder), Duration::from_secs(3600));
    pool.run().unwrap();
    pool.notify();
    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 1));

    let started = Instant::now();
    assert!(pool.shutdown(true));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.nb_threads(), 0);
}

#[test]
fn test_shared_notifier_wakes_every_pool() {
    let notifier = Arc::new(Notifier::new());
    let total = Arc::new(AtomicUsize::new(0));

    let pools: Vec<_> = (0..3)
        .map(|i| {
            let total = Arc::clone(&total);
            let unit = FnUnit::new(move |_: ()| {
                total.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            let pool = SignalPool::new(format!("shared-{}", i), Arc::new(unit), Duration::from_secs(3600))
                .with_notifier(Arc::clone(&notifier));
            pool.run().unwrap();
            pool
        })
        .collect();

    notifier.notify();
    assert!(wait_until(Duration::from_secs(5), || total.load(Ordering::SeqCst) == 3));
    for pool in &pools {
        assert!(pool.shutdown(true));
    }
}

/// A unit can stop its own pool through a handle.
#[test]
fn test_unit_requests_own_shutdown() {
    let handle_slot: Arc<Mutex<Option<SignalHandle>>> = Arc::new(Mutex::new(None));
    let from_unit = Arc::clone(&handle_slot);
    let unit = FnUnit::new(move |_: ()| {
        if let Some(handle) = from_unit.lock().unwrap().as_ref() {
            handle.request_shutdown();
        }
        Ok(())
    });
    let pool = SignalPool::new("selfstop", Arc::new(unit), Duration::from_millis(20));
    *handle_slot.lock().unwrap() = Some(pool.handle());
    pool.run().unwrap();

    assert!(wait_until(Duration::from_secs(5), || pool.nb_threads() == 0));
    assert!(pool.handle().is_terminating());
    assert!(pool.shutdown(true));
}
