//! Thread scaling of dynamic pools.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskpool::config::PoolConfig;
use taskpool::pool::{DynamicPool, FnUnit, PoolHandle, Producer, UnitResult, WorkerUnit};

use crate::helpers::*;

fn burst_config(name: &str) -> PoolConfig {
    PoolConfig::new(name)
        .with_threads(1, 3)
        .with_threshold(50)
        .with_max_tasks(10)
}

/// Backlog above the threshold (5 of 10) adds threads up to the maximum.
#[test]
fn test_grows_toward_max_under_backlog() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(burst_config("burst"), Arc::clone(&unit)).unwrap();
    pool.run().unwrap();
    assert_eq!(pool.nb_threads(), 1);

    for i in 0..6 {
        pool.add_task(i, true).unwrap();
        let threads = pool.nb_threads();
        assert!((1..=3).contains(&threads));
    }
    for i in 6..10 {
        pool.add_task(i, true).unwrap();
    }
    assert_eq!(pool.nb_threads(), 3);

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || unit.done() == 10));
    assert!(pool.shutdown(true));
}

/// Push one task and wait until every thread holds one. Returns the
/// thread count seen right after the push.
fn push_and_settle(pool: &DynamicPool<GatedUnit<u32>>, unit: &GatedUnit<u32>, task: u32) -> usize {
    pool.add_task(task, false).unwrap();
    let threads = pool.nb_threads();
    let pushed = task as usize + 1;
    assert!(wait_until(Duration::from_secs(5), || unit.started() == pushed.min(threads)));
    threads
}

/// The task being run does not count toward the backlog: with 5 of 10 as
/// threshold, the sixth task leaves 5 queued and adds no thread.
#[test]
fn test_growth_steps_at_half_threshold() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(burst_config("steps"), Arc::clone(&unit)).unwrap();
    pool.run().unwrap();

    let threads: Vec<usize> = (0..10).map(|i| push_and_settle(&pool, &unit, i)).collect();
    assert_eq!(threads, [1, 1, 1, 1, 1, 1, 2, 3, 3, 3]);

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || unit.done() == 10));
    assert!(pool.shutdown(true));
}

/// Six tasks against a threshold of 2 grow one thread per push once the
/// backlog passes it, up to the maximum.
#[test]
fn test_six_tasks_reach_max_threads() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(
        PoolConfig::new("six")
            .with_threads(1, 4)
            .with_threshold(20)
            .with_max_tasks(10),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();

    let threads: Vec<usize> = (0..6).map(|i| push_and_settle(&pool, &unit, i)).collect();
    assert_eq!(threads, [1, 1, 1, 2, 3, 4]);
    assert_eq!(pool.stats().pending_tasks, 2);

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || unit.done() == 6));
    assert!(pool.shutdown(true));
}

/// Extra threads retire one per scale-down delay, never below the initial population.
#[test]
fn test_shrinks_back_to_initial_population() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(
        burst_config("shrink").with_scale_down_delay(Duration::from_millis(200)),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();

    for i in 0..10 {
        pool.add_task(i, true).unwrap();
    }
    assert_eq!(pool.nb_threads(), 3);
    gate.open();

    let mut lowest = usize::MAX;
    let shrunk = wait_until(Duration::from_secs(10), || {
        let threads = pool.nb_threads();
        lowest = lowest.min(threads);
        threads == 1
    });
    assert!(shrunk);
    assert_eq!(lowest, 1);

    // Stays at the initial population once idle.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(pool.nb_threads(), 1);
    assert!(pool.shutdown(true));
}

/// With the default 30s delay, a finished burst keeps its threads.
#[test]
fn test_no_retirement_before_scale_down_delay() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(burst_config("steady"), Arc::clone(&unit)).unwrap();
    pool.run().unwrap();

    for i in 0..10 {
        pool.add_task(i, true).unwrap();
    }
    gate.open();
    assert!(wait_until(Duration::from_secs(5), || unit.done() == 10));

    thread::sleep(Duration::from_millis(500));
    assert_eq!(pool.nb_threads(), 3);
    assert!(pool.shutdown(true));
    assert_eq!(pool.nb_threads(), 0);
}

#[test]
fn test_thread_count_stays_within_bounds() {
    let unit = FnUnit::new(|_: usize| {
        thread::sleep(Duration::from_millis(1));
        Ok(())
    });
    let pool = Arc::new(
        DynamicPool::new(
            PoolConfig::new("bounded")
                .with_threads(2, 4)
                .with_threshold(10)
                .with_max_tasks(20)
                .with_scale_down_delay(Duration::from_millis(50)),
            Arc::new(unit),
        )
        .unwrap(),
    );
    pool.run().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let pool = Arc::clone(&pool);
        let stop = Arc::clone(&stop);
        let violations = Arc::clone(&violations);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let threads = pool.nb_threads();
                if !(2..=4).contains(&threads) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for i in 0..50 {
                    pool.add_task(p * 100 + i, true).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || pool.stats().processed_tasks == 200));
    stop.store(true, Ordering::SeqCst);
    watcher.join().unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(pool.shutdown(true));
}

/// shutdown(true) on an idle pool drains every thread.
#[test]
fn test_idle_pool_shutdown() {
    let unit = FnUnit::new(|_: ()| Ok(()));
    let pool = DynamicPool::new(PoolConfig::new("idle").with_threads(3, 5), Arc::new(unit)).unwrap();
    pool.run().unwrap();
    assert_eq!(pool.nb_threads(), 3);

    assert!(pool.shutdown(true));
    assert_eq!(pool.nb_threads(), 0);
}

#[test]
fn test_shutdown_drains_queued_tasks() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(
        PoolConfig::new("drain").with_threads(1, 1).with_max_tasks(10),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();
    for i in 0..5 {
        pool.add_task(i, false).unwrap();
    }

    let opener = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            gate.open();
        })
    };
    assert!(pool.shutdown(true));
    opener.join().unwrap();
    assert_eq!(unit.done(), 5);
}

#[test]
fn test_shutdown_timeout_with_stuck_worker() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(PoolConfig::new("stuck").with_threads(1, 1), Arc::clone(&unit)).unwrap();
    pool.run().unwrap();
    pool.add_task(1, false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || unit.started() == 1));

    assert!(!pool.shutdown_timeout(Duration::from_millis(100)));
    assert_eq!(pool.nb_threads(), 1);

    gate.open();
    assert!(pool.shutdown(true));
}

#[test]
fn test_non_blocking_push_on_full_queue() {
    let gate = Gate::new();
    let unit = GatedUnit::<u32>::new(Arc::clone(&gate));
    let pool = DynamicPool::new(
        PoolConfig::new("full").with_threads(1, 1).with_max_tasks(2),
        Arc::clone(&unit),
    )
    .unwrap();
    pool.run().unwrap();

    pool.add_task(0, false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || unit.started() == 1));
    pool.add_task(1, false).unwrap();
    pool.add_task(2, false).unwrap();

    let err = pool.add_task(3, false).unwrap_err();
    assert!(err.is_full());
    assert_eq!(err.into_inner(), 3);
    assert_eq!(pool.stats().pending_tasks, 2);

    gate.open();
    assert!(pool.shutdown(true));
    assert_eq!(unit.done(), 3);
}

/// Producer feeding a few tasks, then failing.
struct Faulty {
    calls: Arc<AtomicUsize>,
    panics: bool,
}

impl<U: WorkerUnit<Task = u32>> Producer<U> for Faulty {
    fn produce(&self, pool: &PoolHandle<U>) -> UnitResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for i in 0..3 {
            if pool.add_task(i, true).is_err() {
                return Ok(());
            }
        }
        if self.panics {
            panic!("catalogue cursor lost");
        }
        Err("catalogue unreachable".into())
    }
}

fn run_faulty_producer(panics: bool) {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&done);
    let unit = FnUnit::new(move |_: u32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = DynamicPool::new(PoolConfig::new("faulty-producer").with_threads(2, 2), Arc::new(unit))
        .unwrap()
        .with_producer(Faulty {
            calls: Arc::clone(&calls),
            panics,
        });
    pool.run().unwrap();

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 3));
    thread::sleep(Duration::from_millis(200));

    // Not restarted, and the consumers keep serving.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.nb_threads(), 2);
    pool.add_task(99, false).unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 4));
    assert!(pool.shutdown(true));
}

#[test]
fn test_producer_error_keeps_pool_running() {
    run_faulty_producer(false);
}

#[test]
fn test_producer_panic_keeps_pool_running() {
    run_faulty_producer(true);
}
