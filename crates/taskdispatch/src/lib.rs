//! taskdispatch
//!
//! A two-queue task dispatcher.
//!
//! # Executors
//! - Background: a pool of worker threads with quality-of-service tiers
//! - Main: one designated thread running tasks strictly in submission order
//!
//! # Failure policy
//! Every task body runs under `catch_unwind`. A panic in a fire-and-forget
//! task is logged through `tracing` and dropped; a panic in a blocking
//! submission is returned to the blocked caller as
//! [`DispatchError::TaskPanicked`].
//!
//! # Example
//! ```rust,no_run
//! use taskdispatch::{DispatchConfig, Dispatcher, MainExecutor, Qos, ThreadPool};
//!
//! let config = DispatchConfig::default();
//! let pool = ThreadPool::new(&config)?;
//! let main = MainExecutor::new(&config);
//! let dispatcher = Dispatcher::new(&pool, &main);
//!
//! let handle = main.handle();
//! dispatcher.run_background_then_main(
//!     || println!("loading"),
//!     move || {
//!         println!("loaded");
//!         handle.close();
//!     },
//!     Qos::UserInitiated,
//! )?;
//!
//! main.run()?;
//! # Ok::<(), taskdispatch::DispatchError>(())
//! ```

mod config;
mod dispatcher;
mod error;
pub mod group;
pub mod sync;
pub mod task;
pub mod thread;

pub use config::{DispatchConfig, MAX_PENDING_ENV, WORKERS_ENV, num_cpus};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};
pub use group::{Group, GroupState};
pub use sync::{LockHandle, with_lock};
pub use task::{Qos, Task, TaskFn};
pub use thread::{
    BackgroundHandle, BackgroundQueue, Executor, MainExecutor, MainHandle, PendingCounts, PoolStats,
    STARVATION_LIMIT, ThreadPool, TieredQueue,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
