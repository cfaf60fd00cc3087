//! Background Thread Pool
//!
//! Fixed-size pool of worker threads draining a shared [`TieredQueue`].
//! Tasks have no ordering guarantee relative to each other; the queue tier
//! only decides which waiting task a free worker picks up next.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::{Executor, PendingCounts, TieredQueue, block_on_executor};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::task::{Qos, Task, catch_panic};

const EXECUTOR: &str = "background";

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool owning the current thread, 0 outside any pool
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

struct PoolState {
    queue: TieredQueue,
    shutdown: bool,
}

/// State shared between the pool owner, its handles and its workers
struct PoolShared {
    id: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    worker_count: usize,
    max_pending: Option<usize>,
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl PoolShared {
    fn push(&self, qos: Qos, task: Task) -> Result<()> {
        self.enqueue(qos, task, true)
    }

    /// Enqueue past `max_pending`; only shutdown refuses.
    fn push_reserved(&self, qos: Qos, task: Task) -> Result<()> {
        self.enqueue(qos, task, false)
    }

    fn enqueue(&self, qos: Qos, task: Task, bounded: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(DispatchError::ShutDown(EXECUTOR));
        }
        if let Some(capacity) = self.max_pending.filter(|_| bounded) {
            if state.queue.len() >= capacity {
                return Err(DispatchError::QueueFull { executor: EXECUTOR, capacity });
            }
        }
        state.queue.push(qos, task);
        let pending = state.queue.len();
        drop(state);

        self.available.notify_one();
        tracing::trace!(pool = self.id, qos = qos.as_str(), pending, "background.submit");
        Ok(())
    }

    /// Block until a task is available. `None` once shut down and drained.
    fn wait_for_task(&self) -> Option<(Qos, Task)> {
        let mut state = self.state.lock();
        loop {
            if let Some(next) = state.queue.pop() {
                return Some(next);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn on_worker_thread(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.id)
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            tracing::debug!(
                pool = self.id,
                pending = state.queue.len(),
                "background pool shutting down"
            );
        }
        drop(state);
        self.available.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    CURRENT_POOL.with(|current| current.set(shared.id));

    while let Some((qos, task)) = shared.wait_for_task() {
        shared.active.fetch_add(1, Ordering::SeqCst);
        if !task.run_detached(EXECUTOR, Some(qos)) {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);
        shared.completed.fetch_add(1, Ordering::Release);
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

/// Owner of the background worker threads.
///
/// Dropping the pool shuts it down: queued tasks still run, new submissions
/// are rejected, and the workers are joined.
pub struct ThreadPool {
    handle: BackgroundHandle,
    workers: Vec<Worker>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.handle.shared.id)
            .field("workers", &self.workers)
            .field("active_tasks", &self.handle.active())
            .finish()
    }
}

impl ThreadPool {
    /// Create a pool sized and bounded by `config`
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let worker_count = config.resolved_workers();
        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState {
                queue: TieredQueue::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            worker_count,
            max_pending: config.max_pending,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut pool = Self {
            handle: BackgroundHandle { shared: Arc::clone(&shared) },
            workers: Vec::with_capacity(worker_count),
        };
        for id in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            // On failure `pool` drops here and joins the workers spawned so far.
            let thread = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || worker_loop(worker_shared))?;
            pool.workers.push(Worker { id, thread: Some(thread) });
        }

        tracing::info!(
            pool = shared.id,
            workers = worker_count,
            max_pending = ?config.max_pending,
            "background pool started"
        );
        Ok(pool)
    }

    /// Create with a fixed worker count and an unbounded queue
    pub fn with_workers(workers: usize) -> Result<Self> {
        Self::new(&DispatchConfig::default().with_workers(workers))
    }

    /// Cloneable submission handle
    pub fn handle(&self) -> BackgroundHandle {
        self.handle.clone()
    }

    /// Stop accepting work, run what is queued, and join the workers.
    ///
    /// Called from one of this pool's own workers, that worker is not joined.
    pub fn shutdown(&mut self) {
        self.handle.close();

        let current = thread::current().id();
        let mut joined = 0;
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                tracing::warn!(worker = worker.id, "background worker exited abnormally");
            }
            joined += 1;
        }
        if joined > 0 {
            tracing::info!(pool = self.handle.shared.id, joined, "background pool stopped");
        }
    }
}

impl std::ops::Deref for ThreadPool {
    type Target = BackgroundHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable handle for submitting work to a [`ThreadPool`]
#[derive(Clone)]
pub struct BackgroundHandle {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("pool", &self.shared.id)
            .finish()
    }
}

impl BackgroundHandle {
    /// Enqueue a task and return immediately.
    ///
    /// A panic in the task is logged and dropped.
    pub fn submit_async(&self, task: impl Into<Task>, qos: Qos) -> Result<()> {
        let task = task.into().validate()?;
        self.shared.push(qos, task)
    }

    /// Enqueue a task and block until it has run.
    ///
    /// From one of this pool's own workers the task runs inline on the
    /// calling worker, so nested blocking submissions cannot exhaust the pool.
    /// A closed pool rejects it either way.
    pub fn submit_sync(&self, task: impl Into<Task>, qos: Qos) -> Result<()> {
        let task = task.into().validate()?;
        if self.run_inline()? {
            return task.run().map_err(DispatchError::TaskPanicked);
        }
        block_on_executor(EXECUTOR, move || task.run(), |task| self.shared.push(qos, task))
    }

    /// Blocking submission returning the closure's value
    pub fn submit_sync_with<R, F>(&self, f: F, qos: Qos) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.run_inline()? {
            return catch_panic(f).map_err(DispatchError::TaskPanicked);
        }
        block_on_executor(EXECUTOR, move || catch_panic(f), |task| self.shared.push(qos, task))
    }

    /// Enqueue a follow-up of an already accepted operation, ignoring the bound
    pub(crate) fn submit_reserved(&self, task: Task, qos: Qos) -> Result<()> {
        self.shared.push_reserved(qos, task)
    }

    /// `true` when a blocking submission should run on the calling worker
    fn run_inline(&self) -> Result<bool> {
        if !self.shared.on_worker_thread() {
            return Ok(false);
        }
        if self.is_closed() {
            return Err(DispatchError::ShutDown(EXECUTOR));
        }
        Ok(true)
    }

    /// Executor submitting at a fixed tier
    pub fn queue(&self, qos: Qos) -> BackgroundQueue {
        BackgroundQueue { handle: self.clone(), qos }
    }

    /// Check if the calling thread is one of this pool's workers
    pub fn is_worker_thread(&self) -> bool {
        self.shared.on_worker_thread()
    }

    /// Stop accepting new work; workers exit once the queue is drained
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Get worker count
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// Get pending task count
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Get active task count
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Check if pool is idle
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.active() == 0
    }

    /// Get pool stats
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: self.shared.worker_count,
            active: self.active(),
            pending: state.queue.pending_counts(),
            submitted: state.queue.total_scheduled(),
            completed: self.shared.completed.load(Ordering::Acquire),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }
}

/// A [`BackgroundHandle`] pinned to one quality-of-service tier
#[derive(Debug, Clone)]
pub struct BackgroundQueue {
    handle: BackgroundHandle,
    qos: Qos,
}

impl BackgroundQueue {
    pub fn qos(&self) -> Qos {
        self.qos
    }
}

impl Executor for BackgroundQueue {
    fn execute(&self, task: Task) -> Result<()> {
        self.handle.submit_async(task, self.qos)
    }

    fn execute_follow_up(&self, task: Task) -> Result<()> {
        self.handle.submit_reserved(task, self.qos)
    }

    fn name(&self) -> &'static str {
        EXECUTOR
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub pending: PendingCounts,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_thread_pool() {
        let pool = ThreadPool::with_workers(2).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit_async(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Qos::Default,
            )
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 10));
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_submit_sync_waits() {
        let pool = ThreadPool::with_workers(2).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        pool.submit_sync(
            move || {
                thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::SeqCst);
            },
            Qos::UserInitiated,
        )
        .unwrap();

        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_submit_sync_with_value_and_panic() {
        let pool = ThreadPool::with_workers(1).unwrap();
        assert_eq!(pool.submit_sync_with(|| 6 * 7, Qos::Default).unwrap(), 42);

        let err = pool
            .submit_sync_with(|| -> u32 { panic!("sync boom") }, Qos::Default)
            .unwrap_err();
        assert_eq!(err, DispatchError::TaskPanicked("sync boom".into()));
    }

    #[test]
    fn test_nested_sync_runs_inline() {
        let pool = ThreadPool::with_workers(1).unwrap();
        let handle = pool.handle();

        // A single worker would deadlock if the inner call were queued.
        let inner = pool
            .submit_sync_with(
                move || {
                    assert!(handle.is_worker_thread());
                    handle.submit_sync_with(|| "inner", Qos::Background)
                },
                Qos::Default,
            )
            .unwrap();
        assert_eq!(inner.unwrap(), "inner");
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = ThreadPool::with_workers(1).unwrap();
        pool.submit_async(Task::named("explodes", || panic!("async boom")), Qos::Default)
            .unwrap();

        assert_eq!(pool.submit_sync_with(|| 1, Qos::Default).unwrap(), 1);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn test_bounded_queue_rejects() {
        let config = DispatchConfig::default().with_workers(1).with_max_pending(1);
        let pool = ThreadPool::new(&config).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        pool.submit_async(
            move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            },
            Qos::Default,
        )
        .unwrap();
        started_rx.recv().unwrap();

        pool.submit_async(|| {}, Qos::Default).unwrap();
        let err = pool.submit_async(|| {}, Qos::Default).unwrap_err();
        assert_eq!(err, DispatchError::QueueFull { executor: "background", capacity: 1 });

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_shutdown_drains_then_rejects() {
        let mut pool = ThreadPool::with_workers(1).unwrap();
        let handle = pool.handle();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            handle
                .submit_async(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    Qos::Utility,
                )
                .unwrap();
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(handle.is_closed());
        assert_eq!(
            handle.submit_async(|| {}, Qos::Default),
            Err(DispatchError::ShutDown("background"))
        );
    }

    #[test]
    fn test_nested_sync_after_close_rejected() {
        let pool = ThreadPool::with_workers(1).unwrap();
        let handle = pool.handle();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (result_tx, result_rx) = std::sync::mpsc::channel();

        let inner = pool.handle();
        handle
            .submit_async(
                move || {
                    started_tx.send(()).unwrap();
                    let _ = release_rx.recv();
                    result_tx.send(inner.submit_sync_with(|| 1, Qos::Default)).unwrap();
                },
                Qos::Default,
            )
            .unwrap();
        started_rx.recv().unwrap();

        handle.close();
        release_tx.send(()).unwrap();

        // Already-queued work still runs, but it cannot submit more.
        let nested = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(nested, Err(DispatchError::ShutDown("background")));
    }

    #[test]
    fn test_reserved_submit_ignores_bound() {
        let config = DispatchConfig::default().with_workers(1).with_max_pending(1);
        let pool = ThreadPool::new(&config).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let ran = Arc::new(AtomicU32::new(0));

        pool.submit_async(
            move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            },
            Qos::Default,
        )
        .unwrap();
        started_rx.recv().unwrap();
        pool.submit_async(|| {}, Qos::Default).unwrap();

        let counter = Arc::clone(&ran);
        let follow_up = Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.queue(Qos::Utility).execute_follow_up(follow_up).unwrap();
        assert_eq!(pool.pending(), 2);

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 1));

        pool.close();
        assert_eq!(
            pool.submit_reserved(Task::new(|| {}), Qos::Default),
            Err(DispatchError::ShutDown("background"))
        );
    }

    #[test]
    fn test_empty_task_not_enqueued() {
        let pool = ThreadPool::with_workers(1).unwrap();
        assert_eq!(pool.submit_async(Task::empty(), Qos::Default), Err(DispatchError::EmptyTask));
        assert_eq!(pool.stats().submitted, 0);
    }
}
