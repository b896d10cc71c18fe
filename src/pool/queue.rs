//! Bounded FIFO task queue shared by producers and consumer threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::error::{PopError, PushError};

/// A queued payload with the instant it was enqueued.
#[derive(Debug)]
pub struct Task<T> {
    /// The opaque payload.
    pub payload: T,
    /// When the task was queued.
    pub queued_at: Instant,
}

struct State<T> {
    items: VecDeque<Task<T>>,
    closed: bool,
}

/// Bounded, thread-safe FIFO of tasks.
///
/// Blocking operations wait on condition variables; spurious wake-ups are
/// absorbed by re-checking the state, so callers never see them.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `capacity` tasks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a payload.
    ///
    /// With `blocking` the call waits for room; otherwise a full queue
    /// rejects the payload with [`PushError::Full`]. A terminated queue
    /// always rejects with [`PushError::Closed`].
    pub fn push(&self, payload: T, blocking: bool) -> Result<(), PushError<T>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(payload));
            }
            if state.items.len() < self.capacity {
                break;
            }
            if !blocking {
                return Err(PushError::Full(payload));
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.items.push_back(Task {
            payload,
            queued_at: Instant::now(),
        });
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest task.
    ///
    /// Blocks until a task is available unless `non_blocking` is set, in
    /// which case an empty queue yields [`PopError::WouldBlock`]. Tasks
    /// queued before [`terminate`](Self::terminate) are still handed out;
    /// [`PopError::Closed`] is only returned once the queue is drained.
    pub fn pop(&self, non_blocking: bool) -> Result<Task<T>, PopError> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(task);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            if non_blocking {
                return Err(PopError::WouldBlock);
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Advisory number of queued tasks.
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
