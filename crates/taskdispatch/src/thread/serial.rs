//! Main Executor
//!
//! A serial FIFO queue drained by exactly one designated thread. The executor
//! is an explicit object: it is either driven by the thread that calls
//! [`MainExecutor::run`] (typically the process main thread) or owns a
//! dedicated thread created by [`MainExecutor::spawn`]. The main thread is
//! bound when the executor is created and never changes afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::{Executor, block_on_executor};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::task::{Task, catch_panic};

const EXECUTOR: &str = "main";

struct SerialState {
    tasks: VecDeque<Task>,
    shutdown: bool,
    submitted: u64,
}

struct SerialShared {
    state: Mutex<SerialState>,
    available: Condvar,
    owner: OnceLock<ThreadId>,
    draining: AtomicBool,
    max_pending: Option<usize>,
    completed: AtomicU64,
}

impl SerialShared {
    fn push(&self, task: Task) -> Result<()> {
        self.enqueue(task, true)
    }

    /// Enqueue past `max_pending`; only shutdown refuses.
    fn push_reserved(&self, task: Task) -> Result<()> {
        self.enqueue(task, false)
    }

    fn enqueue(&self, task: Task, bounded: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(DispatchError::ShutDown(EXECUTOR));
        }
        if let Some(capacity) = self.max_pending.filter(|_| bounded) {
            if state.tasks.len() >= capacity {
                return Err(DispatchError::QueueFull { executor: EXECUTOR, capacity });
            }
        }
        state.tasks.push_back(task);
        state.submitted += 1;
        let pending = state.tasks.len();
        drop(state);

        self.available.notify_one();
        tracing::trace!(pending, "main.submit");
        Ok(())
    }

    fn is_main_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Claim the drain loop. `None` when already draining further up the stack.
    fn enter_drain(&self) -> Result<Option<DrainGuard<'_>>> {
        if !self.is_main_thread() {
            return Err(DispatchError::NotMainThread);
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        Ok(Some(DrainGuard(&self.draining)))
    }

    fn execute(&self, task: Task) {
        task.run_detached(EXECUTOR, None);
        self.completed.fetch_add(1, Ordering::Release);
    }

    fn run(&self) -> Result<()> {
        let Some(_guard) = self.enter_drain()? else {
            return Ok(());
        };
        tracing::debug!("main executor running");

        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.shutdown {
                        let completed = self.completed.load(Ordering::Acquire);
                        tracing::debug!(completed, "main executor stopped");
                        return Ok(());
                    }
                    self.available.wait(&mut state);
                }
            };
            self.execute(task);
        }
    }

    fn run_pending(&self) -> Result<usize> {
        let Some(_guard) = self.enter_drain()? else {
            return Ok(0);
        };

        // Only what was queued on entry; tasks queued meanwhile wait for the next call.
        let batch = std::mem::take(&mut self.state.lock().tasks);
        let count = batch.len();
        for task in batch {
            self.execute(task);
        }
        Ok(count)
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of the serial main queue.
///
/// Tasks run strictly in submission order and never concurrently with each
/// other. Dropping the executor shuts it down, joins its dedicated thread if
/// it has one, and discards tasks that never got to run.
pub struct MainExecutor {
    handle: MainHandle,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainExecutor")
            .field("dedicated_thread", &self.thread.is_some())
            .field("pending", &self.handle.pending())
            .finish()
    }
}

impl MainExecutor {
    /// Create an executor driven by the calling thread.
    ///
    /// The calling thread becomes the main thread right away: blocking
    /// submissions from it run inline even before it starts draining, and
    /// only it may call [`run`](Self::run) or [`run_pending`](Self::run_pending).
    pub fn new(config: &DispatchConfig) -> Self {
        let executor = Self::unbound(config);
        let _ = executor.handle.shared.owner.set(thread::current().id());
        executor
    }

    /// Create an executor that owns a dedicated, named main thread
    pub fn spawn(config: &DispatchConfig) -> Result<Self> {
        let mut executor = Self::unbound(config);
        let shared = Arc::clone(&executor.handle.shared);
        let thread = thread::Builder::new()
            .name(config.main_thread_name.clone())
            .spawn(move || {
                let _ = shared.owner.set(thread::current().id());
                if let Err(err) = shared.run() {
                    tracing::error!(%err, "main executor thread failed to start");
                }
            })?;
        // Bound before returning, whether or not the thread got scheduled yet.
        let _ = executor.handle.shared.owner.set(thread.thread().id());
        tracing::info!(thread = %config.main_thread_name, "main executor started");
        executor.thread = Some(thread);
        Ok(executor)
    }

    fn unbound(config: &DispatchConfig) -> Self {
        Self {
            handle: MainHandle {
                shared: Arc::new(SerialShared {
                    state: Mutex::new(SerialState {
                        tasks: VecDeque::new(),
                        shutdown: false,
                        submitted: 0,
                    }),
                    available: Condvar::new(),
                    owner: OnceLock::new(),
                    draining: AtomicBool::new(false),
                    max_pending: config.main_max_pending,
                    completed: AtomicU64::new(0),
                }),
            },
            thread: None,
        }
    }

    /// Cloneable submission handle
    pub fn handle(&self) -> MainHandle {
        self.handle.clone()
    }

    /// Drain the queue on the main thread until shutdown.
    ///
    /// Returns once [`MainHandle::close`] was requested and every queued task
    /// has run. Any other thread gets [`DispatchError::NotMainThread`].
    pub fn run(&self) -> Result<()> {
        self.handle.shared.run()
    }

    /// Run the tasks queued right now without blocking; returns how many ran.
    ///
    /// For hosts that own their event loop. Only the main thread may call it;
    /// called from inside a main task it does nothing.
    pub fn run_pending(&self) -> Result<usize> {
        self.handle.shared.run_pending()
    }

    /// Stop accepting work and join the dedicated thread, if any
    pub fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::warn!("main executor thread exited abnormally");
            }
            tracing::info!("main executor stopped");
        }
    }
}

impl std::ops::Deref for MainExecutor {
    type Target = MainHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for MainExecutor {
    fn drop(&mut self) {
        self.shutdown();
        let leftover = std::mem::take(&mut self.handle.shared.state.lock().tasks);
        if !leftover.is_empty() {
            tracing::debug!(discarded = leftover.len(), "main executor dropped with queued tasks");
        }
    }
}

/// Cloneable handle for submitting work to a [`MainExecutor`]
#[derive(Clone)]
pub struct MainHandle {
    shared: Arc<SerialShared>,
}

impl std::fmt::Debug for MainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainHandle")
            .field("main_thread", &self.shared.owner.get())
            .finish()
    }
}

impl MainHandle {
    /// Enqueue a task behind every task submitted before it
    pub fn submit_async(&self, task: impl Into<Task>) -> Result<()> {
        let task = task.into().validate()?;
        self.shared.push(task)
    }

    /// Enqueue a task and block until it has run.
    ///
    /// Called from the main thread itself, the task runs inline right away.
    /// From any other thread this blocks until the main thread drains it.
    pub fn submit_sync(&self, task: impl Into<Task>) -> Result<()> {
        let task = task.into().validate()?;
        if self.run_inline()? {
            return task.run().map_err(DispatchError::TaskPanicked);
        }
        block_on_executor(EXECUTOR, move || task.run(), |task| self.shared.push(task))
    }

    /// Blocking submission returning the closure's value
    pub fn submit_sync_with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.run_inline()? {
            return catch_panic(f).map_err(DispatchError::TaskPanicked);
        }
        block_on_executor(EXECUTOR, move || catch_panic(f), |task| self.shared.push(task))
    }

    /// Enqueue a follow-up of an already accepted operation, ignoring the bound
    pub(crate) fn submit_reserved(&self, task: Task) -> Result<()> {
        self.shared.push_reserved(task)
    }

    fn run_inline(&self) -> Result<bool> {
        if !self.shared.is_main_thread() {
            return Ok(false);
        }
        if self.is_closed() {
            return Err(DispatchError::ShutDown(EXECUTOR));
        }
        Ok(true)
    }

    /// Check if the calling thread is the bound main thread
    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }

    /// Stop accepting work; the drain loop returns once the queue is empty
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Get pending task count
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Tasks accepted so far
    pub fn submitted(&self) -> u64 {
        self.shared.state.lock().submitted
    }

    /// Tasks run so far
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }
}

impl Executor for MainHandle {
    fn execute(&self, task: Task) -> Result<()> {
        self.submit_async(task)
    }

    fn execute_follow_up(&self, task: Task) -> Result<()> {
        self.submit_reserved(task)
    }

    fn name(&self) -> &'static str {
        EXECUTOR
    }
}
