//! Blocking-aware synchronisation primitives.
//!
//! Everything here is a mutex/condition-variable pair. Structures shared by a
//! real-time thread and a worker thread use these rather than lock-free
//! queues; timed variants return `bool`/`Option` instead of erroring so
//! callers can build bounded waits without busy-polling.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Wait on `cond` until `done(&guard)` holds or `deadline` passes.
///
/// Returns `false` on timeout.
pub fn wait_until<T, F>(cond: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Instant, mut done: F) -> bool
where
    F: FnMut(&T) -> bool,
{
    while !done(&**guard) {
        if cond.wait_until(guard, deadline).timed_out() {
            return done(&**guard);
        }
    }
    true
}

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Returns `false` if no permit became available within `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        if !wait_until(&self.cond, &mut permits, deadline, |p| *p > 0) {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO queue whose consumers block until an item arrives or the queue is
/// closed.
///
/// After [`close`](Self::close) pushes are refused, remaining items can still
/// be drained, and `pop` returns `None` once the queue is empty.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Push an item. Returns it back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Block until an item is available; `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        wait_until(&self.cond, &mut state, deadline, |s| !s.items.is_empty() || s.closed);
        state.items.pop_front()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn semaphore_timeout_returns_false() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        let start = Instant::now();
        assert!(!sem.acquire_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        sem.release();
        assert!(sem.acquire_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn queue_close_drains_then_ends() {
        let queue = Arc::new(BlockingQueue::new());
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.push(3), Err(3));

        let q = queue.clone();
        let drained = thread::spawn(move || {
            let mut out = Vec::new();
            while let Some(v) = q.pop() {
                out.push(v);
            }
            out
        })
        .join()
        .unwrap();
        assert_eq!(drained, vec![1, 2]);
    }

    #[test]
    fn pop_timeout_on_empty_queue() {
        let queue: BlockingQueue<u32> = BlockingQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
    }
}
