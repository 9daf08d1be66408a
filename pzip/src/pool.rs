//! Generic bounded worker pool.
//!
//! A fixed-capacity FIFO of tasks served by a set of threads. `enqueue`
//! blocks while the queue is full, which is the backpressure that bounds
//! peak memory across the pipeline. The first executor error is kept and
//! flips the pool into cancel mode so the remaining tasks drain fast.
//! With a concurrency of one the pool acts as a serializer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::{PzipError, Result};

pub type Executor<T> = Box<dyn Fn(T) -> Result<()> + Send + Sync>;

struct PoolState<T> {
    queue: VecDeque<T>,
    shutdown: bool,
}

struct PoolShared<T> {
    state: Mutex<PoolState<T>>,
    task_available: Condvar,
    space_available: Condvar,
    cancelled: AtomicBool,
    first_error: Mutex<Option<PzipError>>,
    executor: Executor<T>,
    capacity: usize,
}

fn lock_state<T>(shared: &PoolShared<T>) -> MutexGuard<'_, PoolState<T>> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `concurrency` of zero means one worker per hardware thread.
    pub fn new(executor: Executor<T>, concurrency: usize, capacity: usize) -> Self {
        let concurrency = if concurrency == 0 {
            num_cpus::get()
        } else {
            concurrency
        };
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                task_available: Condvar::new(),
                space_available: Condvar::new(),
                cancelled: AtomicBool::new(false),
                first_error: Mutex::new(None),
                executor,
                capacity: capacity.max(1),
            }),
            workers: Mutex::new(Vec::new()),
            concurrency,
        }
    }

    pub fn start(&self) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !workers.is_empty() {
            return;
        }

        {
            let mut state = lock_state(&self.shared);
            state.shutdown = false;
            state.queue.clear();
        }
        self.shared.cancelled.store(false, Ordering::SeqCst);
        if let Ok(mut first) = self.shared.first_error.lock() {
            *first = None;
        }

        workers.reserve(self.concurrency);
        for _ in 0..self.concurrency {
            let shared = Arc::clone(&self.shared);
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }
    }

    /// Blocks while the queue is full; a task arriving after shutdown or
    /// cancel is dropped.
    pub fn enqueue(&self, task: T) {
        let shared = &self.shared;
        let mut state = lock_state(shared);

        while state.queue.len() >= shared.capacity
            && !state.shutdown
            && !shared.cancelled.load(Ordering::SeqCst)
        {
            state = match shared.space_available.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        if state.shutdown || shared.cancelled.load(Ordering::SeqCst) {
            return;
        }

        state.queue.push_back(task);
        shared.task_available.notify_one();
    }

    /// Waits for the queue to drain, joins the workers, and surfaces the
    /// first error any executor produced.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = lock_state(&self.shared);
            state.shutdown = true;
        }
        self.shared.task_available.notify_all();
        self.shared.space_available.notify_all();

        let handles = {
            let mut workers = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *workers)
        };
        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
            }
        }

        let mut first = match self.shared.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match first.take() {
            Some(err) => Err(err),
            None if panicked => Err(PzipError::Unknown("worker thread panicked".to_string())),
            None => Ok(()),
        }
    }

    /// Drops all pending tasks and wakes everyone.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        {
            let mut state = lock_state(&self.shared);
            state.queue.clear();
        }
        self.shared.task_available.notify_all();
        self.shared.space_available.notify_all();
    }

    pub fn pending_tasks(&self) -> usize {
        lock_state(&self.shared).queue.len()
    }
}

fn worker_loop<T: Send + 'static>(shared: Arc<PoolShared<T>>) {
    loop {
        let task = {
            let mut state = lock_state(&shared);

            while state.queue.is_empty()
                && !state.shutdown
                && !shared.cancelled.load(Ordering::SeqCst)
            {
                state = match shared.task_available.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }

            if shared.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if state.shutdown && state.queue.is_empty() {
                return;
            }

            let task = state.queue.pop_front();
            if task.is_some() {
                shared.space_available.notify_one();
            }
            task
        };

        if let Some(task) = task {
            if shared.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = (shared.executor)(task) {
                let mut first = match shared.first_error.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if first.is_none() {
                    log::debug!("worker pool stopping on first error: {err}");
                    *first = Some(err);
                }
                drop(first);
                shared.cancelled.store(true, Ordering::SeqCst);
                // Wake producers stuck on a full queue as well.
                shared.task_available.notify_all();
                shared.space_available.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_and_close_returns_ok() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let pool = WorkerPool::new(
            Box::new(move |n: usize| {
                seen.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }),
            4,
            8,
        );
        pool.start();
        for i in 1..=100 {
            pool.enqueue(i);
        }
        pool.close().expect("close should succeed");
        assert_eq!(counter.load(Ordering::SeqCst), (1..=100).sum());
    }

    #[test]
    fn a_single_worker_preserves_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let pool = WorkerPool::new(
            Box::new(move |n: usize| {
                sink.lock().unwrap().push(n);
                Ok(())
            }),
            1,
            4,
        );
        pool.start();
        for i in 0..50 {
            pool.enqueue(i);
        }
        pool.close().expect("close");
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn first_error_is_surfaced_and_stops_the_pool() {
        let executed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&executed);
        let pool = WorkerPool::new(
            Box::new(move |n: usize| {
                seen.fetch_add(1, Ordering::SeqCst);
                if n == 3 {
                    Err(PzipError::FileRead("task 3 exploded".to_string()))
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    Ok(())
                }
            }),
            1,
            4,
        );
        pool.start();
        for i in 0..200 {
            pool.enqueue(i);
        }
        let err = pool.close().expect_err("close should report the error");
        assert!(matches!(err, PzipError::FileRead(_)));
        // The error cancels the pool, so the tail of the queue never runs.
        assert!(executed.load(Ordering::SeqCst) < 200);
    }

    #[test]
    fn enqueue_blocks_at_capacity() {
        let gate = Arc::new(AtomicBool::new(false));
        let release = Arc::clone(&gate);
        let pool = Arc::new(WorkerPool::new(
            Box::new(move |_: usize| {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Ok(())
            }),
            1,
            2,
        ));
        pool.start();

        let producer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..10 {
                    pool.enqueue(i);
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        // One task held by the worker, at most two queued.
        assert!(pool.pending_tasks() <= 2);
        gate.store(true, Ordering::SeqCst);
        producer.join().unwrap();
        pool.close().expect("close");
    }

    #[test]
    fn cancel_clears_pending_tasks() {
        let executed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&executed);
        let pool = WorkerPool::new(
            Box::new(move |_: usize| {
                seen.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(())
            }),
            1,
            100,
        );
        pool.start();
        for i in 0..100 {
            pool.enqueue(i);
        }
        pool.cancel();
        pool.close().expect("close after cancel");
        assert!(executed.load(Ordering::SeqCst) < 100);
        assert_eq!(pool.pending_tasks(), 0);
    }
}
