//! Test helpers and utilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskpool::pool::{UnitResult, WorkerUnit};

/// Poll `check` every 10ms until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// A latch workers block on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

#[allow(dead_code)]
impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// Worker unit holding every task until its gate opens.
pub struct GatedUnit<T> {
    pub gate: Arc<Gate>,
    pub started: AtomicUsize,
    pub done: AtomicUsize,
    _task: std::marker::PhantomData<fn(T)>,
}

#[allow(dead_code)]
impl<T> GatedUnit<T> {
    pub fn new(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gate,
            started: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            _task: std::marker::PhantomData,
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> WorkerUnit for GatedUnit<T> {
    type Task = T;

    fn run(&self, task: T) -> UnitResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.wait();
        drop(task);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
