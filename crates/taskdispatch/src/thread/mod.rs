//! Threading Model
//!
//! Two executors built on OS threads:
//! - Background worker pool with quality-of-service tiers
//! - Serial main executor bound to one designated thread

mod pool;
mod scheduler;
mod serial;

pub use pool::*;
pub use scheduler::*;
pub use serial::*;

use std::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::task::Task;

/// Something that runs tasks.
pub trait Executor: Send + Sync {
    /// Enqueue a task and return immediately.
    fn execute(&self, task: Task) -> Result<()>;

    /// Enqueue a follow-up whose parent operation was already accepted.
    ///
    /// Bounded executors admit it past their capacity; only shutdown
    /// refuses it.
    fn execute_follow_up(&self, task: Task) -> Result<()> {
        self.execute(task)
    }

    /// Executor name used in logs and errors
    fn name(&self) -> &'static str;
}

/// Submit `f` through `submit` and block until it has run.
///
/// A panic inside `f` becomes [`DispatchError::TaskPanicked`]. If the executor
/// discards the task without running it, the waiter gets
/// [`DispatchError::ShutDown`].
pub(crate) fn block_on_executor<R, F>(
    executor: &'static str,
    f: F,
    submit: impl FnOnce(Task) -> Result<()>,
) -> Result<R>
where
    F: FnOnce() -> std::result::Result<R, String> + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    submit(Task::new(move || {
        // The waiter may have gone away; nothing to report then.
        let _ = tx.send(f());
    }))?;

    match rx.recv() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(DispatchError::TaskPanicked(message)),
        Err(_) => Err(DispatchError::ShutDown(executor)),
    }
}
