//! Dispatcher - routes work to the background pool or the main executor

use crate::error::Result;
use crate::group::Group;
use crate::task::{Qos, Task, catch_panic};
use crate::thread::{BackgroundHandle, MainExecutor, MainHandle, ThreadPool};

/// Facade over both executors.
///
/// Cheap to clone; every clone submits to the same pool and main queue.
/// Every operation validates all of its tasks before enqueueing anything.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    background: BackgroundHandle,
    main: MainHandle,
}

impl Dispatcher {
    /// Create a dispatcher over a pool and a main executor
    pub fn new(pool: &ThreadPool, main: &MainExecutor) -> Self {
        Self::from_handles(pool.handle(), main.handle())
    }

    pub fn from_handles(background: BackgroundHandle, main: MainHandle) -> Self {
        Self { background, main }
    }

    pub fn background(&self) -> &BackgroundHandle {
        &self.background
    }

    pub fn main(&self) -> &MainHandle {
        &self.main
    }

    /// Fire-and-forget on the background pool
    pub fn run_background(&self, task: impl Into<Task>, qos: Qos) -> Result<()> {
        self.background.submit_async(task, qos)
    }

    /// Run on the background pool and block until done
    pub fn run_background_blocking(&self, task: impl Into<Task>, qos: Qos) -> Result<()> {
        self.background.submit_sync(task, qos)
    }

    /// Run on the background pool, block, and return the closure's value
    pub fn run_background_blocking_with<R, F>(&self, f: F, qos: Qos) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.background.submit_sync_with(f, qos)
    }

    /// Fire-and-forget on the main executor, in submission order
    pub fn run_main(&self, task: impl Into<Task>) -> Result<()> {
        self.main.submit_async(task)
    }

    /// Run on the main executor and block until done
    pub fn run_main_blocking(&self, task: impl Into<Task>) -> Result<()> {
        self.main.submit_sync(task)
    }

    /// Run on the main executor, block, and return the closure's value
    pub fn run_main_blocking_with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main.submit_sync_with(f)
    }

    /// Run `background` on the pool, then queue `main` on the main executor.
    ///
    /// `main` is queued once `background` has finished, even if it panicked.
    /// Its slot on the main queue is reserved at submission, so a full main
    /// queue never drops it. Returns immediately.
    pub fn run_background_then_main(
        &self,
        background: impl Into<Task>,
        main: impl Into<Task>,
        qos: Qos,
    ) -> Result<()> {
        let background = background.into().validate()?;
        let continuation = main.into().validate()?;
        let label = background.label().map(str::to_owned);
        let main_handle = self.main.clone();

        let chained = background.wrap(move |body| {
            if let Err(message) = catch_panic(body) {
                tracing::error!(
                    qos = qos.as_str(),
                    task = label.as_deref().unwrap_or("<unnamed>"),
                    %message,
                    "background stage panicked; running main stage anyway"
                );
            }
            if let Err(err) = main_handle.submit_reserved(continuation) {
                tracing::warn!(%err, "main stage rejected");
            }
        });
        self.background.submit_async(chained, qos)
    }

    /// Run `background` on the pool and hand its result to `main` on the
    /// main executor.
    ///
    /// If `background` panics there is no value to hand over; the panic is
    /// logged and `main` is dropped.
    pub fn run_background_then_main_with<T, B, M>(
        &self,
        background: B,
        main: M,
        qos: Qos,
    ) -> Result<()>
    where
        B: FnOnce() -> T + Send + 'static,
        M: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let main_handle = self.main.clone();
        self.background.submit_async(
            move || match catch_panic(background) {
                Ok(value) => {
                    let stage = Task::new(move || main(value));
                    if let Err(err) = main_handle.submit_reserved(stage) {
                        tracing::warn!(%err, "main stage rejected");
                    }
                }
                Err(message) => {
                    tracing::error!(
                        qos = qos.as_str(),
                        %message,
                        "background stage panicked; main stage skipped"
                    );
                }
            },
            qos,
        )
    }

    /// Run `first` on the pool and `then` on the pool after it completes.
    ///
    /// Once `first` is accepted, `then` is guaranteed a slot on the pool even
    /// if the queue is full by the time `first` finishes. Returns immediately
    /// with the group tracking `first`; call [`Group::wait`] to block until
    /// `first` is done.
    pub fn wait_then_continue(
        &self,
        first: impl Into<Task>,
        then: impl Into<Task>,
        qos: Qos,
    ) -> Result<Group> {
        let first = first.into().validate()?;
        let then = then.into().validate()?;

        let queue = self.background.queue(qos);
        let group = Group::new();
        // Held across setup so `then` is always registered, never run
        // through the bounded immediate path.
        group.enter();
        if let Err(err) = group.spawn(&queue, first) {
            group.leave();
            return Err(err);
        }
        let registered = group.notify(&queue, then);
        group.leave();
        registered?;
        tracing::trace!(qos = qos.as_str(), "dispatch.wait_then_continue");
        Ok(group)
    }
}
