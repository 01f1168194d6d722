//! Resizable worker pool
//!
//! One OS thread is started per ceiling slot, but a thread only works while it
//! holds a permit and at most `current` permits exist at a time. Changing
//! `current` therefore resizes the pool without tearing threads down.
//! Tasks are claimed through an atomic cursor, so each runs exactly once.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{debug, Span};

/// How often a waiting worker rechecks the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Shared stop request. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with signal handlers.
    pub fn as_arc(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Snapshot of the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolState {
    pub current: usize,
    pub ceiling: usize,
}

#[derive(Debug)]
struct Gate {
    limit: usize,
    active: usize,
}

/// Bounded pool whose active size may change while tasks run.
#[derive(Debug)]
pub struct WorkerPool {
    ceiling: usize,
    gate: Mutex<Gate>,
    cvar: Condvar,
}

/// Held by a worker while it runs one task.
#[derive(Debug)]
pub struct WorkPermit<'a> {
    pool: &'a WorkerPool,
}

impl Drop for WorkPermit<'_> {
    fn drop(&mut self) {
        let mut gate = self.pool.gate.lock();
        gate.active = gate.active.saturating_sub(1);
        self.pool.cvar.notify_all();
    }
}

impl WorkerPool {
    /// `initial` is clamped into `[1, ceiling]`; a zero ceiling counts as 1.
    pub fn new(initial: usize, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            gate: Mutex::new(Gate {
                limit: initial.clamp(1, ceiling),
                active: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn state(&self) -> WorkerPoolState {
        WorkerPoolState {
            current: self.gate.lock().limit,
            ceiling: self.ceiling,
        }
    }

    pub fn current(&self) -> usize {
        self.gate.lock().limit
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Workers currently holding a permit.
    pub fn active(&self) -> usize {
        self.gate.lock().active
    }

    /// Set the worker count to `requested` clamped into `[1, ceiling]` if it
    /// is still `expected`. Returns the count in effect afterwards on success
    /// and the unexpected current count on failure.
    pub fn compare_and_resize(&self, expected: usize, requested: usize) -> Result<usize, usize> {
        let mut gate = self.gate.lock();
        if gate.limit != expected {
            return Err(gate.limit);
        }
        let next = requested.clamp(1, self.ceiling);
        if next != gate.limit {
            debug!(from = gate.limit, to = next, "Resizing worker pool");
            gate.limit = next;
            self.cvar.notify_all();
        }
        Ok(next)
    }

    /// Block until a permit is free. Returns `None` once `cancel` is raised.
    pub fn acquire(&self, cancel: &CancelFlag) -> Option<WorkPermit<'_>> {
        let mut gate = self.gate.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if gate.active < gate.limit {
                gate.active += 1;
                return Some(WorkPermit { pool: self });
            }
            self.cvar.wait_for(&mut gate, CANCEL_POLL);
        }
    }

    /// Run `work` over every task on the pool's threads, feeding each result
    /// to `on_result` on the calling thread as soon as it is ready.
    ///
    /// `on_result` may resize the pool. Results arrive in completion order,
    /// not task order. After cancellation no new task is started and the call
    /// returns once running tasks finish.
    pub fn run<T, R, F, C>(
        &self,
        tasks: &[T],
        cancel: &CancelFlag,
        span: &Span,
        work: F,
        mut on_result: C,
    ) where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync,
        C: FnMut(R),
    {
        let cursor = AtomicUsize::new(0);
        let threads = self.ceiling.min(tasks.len());
        let work = &work;
        let cursor = &cursor;

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for worker in 0..threads {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _entered = span.enter();
                    loop {
                        let Some(permit) = self.acquire(cancel) else {
                            break;
                        };
                        let next = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(task) = tasks.get(next) else {
                            break;
                        };
                        let result = work(task);
                        drop(permit);
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                    debug!(worker, "Worker finished");
                });
            }
            drop(tx);

            for result in rx {
                on_result(result);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn new_clamps_initial_size() {
        assert_eq!(WorkerPool::new(0, 4).current(), 1);
        assert_eq!(WorkerPool::new(9, 4).current(), 4);
        assert_eq!(WorkerPool::new(3, 0).state(), WorkerPoolState { current: 1, ceiling: 1 });
    }

    #[test]
    fn resize_is_bounded_and_compare_checked() {
        let pool = WorkerPool::new(2, 4);
        assert_eq!(pool.compare_and_resize(2, 10), Ok(4));
        assert_eq!(pool.compare_and_resize(4, 0), Ok(1));
        assert_eq!(pool.compare_and_resize(3, 2), Err(1));
        assert_eq!(pool.current(), 1);
    }

    #[test]
    fn permits_respect_limit() {
        let pool = WorkerPool::new(2, 4);
        let cancel = CancelFlag::new();
        let a = pool.acquire(&cancel).unwrap();
        let _b = pool.acquire(&cancel).unwrap();
        assert_eq!(pool.active(), 2);
        drop(a);
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn blocked_worker_wakes_on_grow() {
        let pool = Arc::new(WorkerPool::new(1, 2));
        let cancel = CancelFlag::new();
        let held = pool.acquire(&cancel).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            thread::spawn(move || pool.acquire(&cancel).is_some())
        };
        thread::sleep(Duration::from_millis(20));
        pool.compare_and_resize(1, 2).unwrap();
        assert!(waiter.join().unwrap());
        drop(held);
    }

    #[test]
    fn cancel_releases_waiters() {
        let pool = Arc::new(WorkerPool::new(1, 1));
        let cancel = CancelFlag::new();
        let _held = pool.acquire(&cancel).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            thread::spawn(move || pool.acquire(&cancel).is_none())
        };
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn every_task_runs_once() {
        let pool = WorkerPool::new(3, 8);
        let tasks: Vec<usize> = (0..200).collect();
        let mut seen = HashSet::new();
        pool.run(&tasks, &CancelFlag::new(), &Span::none(), |t| *t * 2, |r| {
            assert!(seen.insert(r));
        });
        assert_eq!(seen.len(), 200);
        assert!(seen.contains(&398));
    }

    #[test]
    fn concurrency_never_exceeds_limit() {
        let pool = WorkerPool::new(2, 8);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let tasks: Vec<usize> = (0..40).collect();
        pool.run(
            &tasks,
            &CancelFlag::new(),
            &Span::none(),
            |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
            },
            |_| {},
        );
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn resize_from_result_callback() {
        let pool = WorkerPool::new(1, 4);
        let tasks: Vec<usize> = (0..20).collect();
        let mut done = 0;
        pool.run(&tasks, &CancelFlag::new(), &Span::none(), |t| *t, |_| {
            done += 1;
            if done == 5 {
                let current = pool.current();
                pool.compare_and_resize(current, current + 2).unwrap();
            }
        });
        assert_eq!(done, 20);
        assert_eq!(pool.current(), 3);
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let pool = WorkerPool::new(4, 4);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let tasks: Vec<usize> = (0..10).collect();
        let mut results = 0;
        pool.run(&tasks, &cancel, &Span::none(), |t| *t, |_| results += 1);
        assert_eq!(results, 0);
    }

    #[test]
    fn empty_task_list_is_a_no_op() {
        let pool = WorkerPool::new(4, 4);
        let tasks: Vec<usize> = Vec::new();
        let mut results = 0;
        pool.run(&tasks, &CancelFlag::new(), &Span::none(), |t| *t, |_| results += 1);
        assert_eq!(results, 0);
    }
}
