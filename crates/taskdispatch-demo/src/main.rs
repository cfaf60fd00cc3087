//! Demo: the process main thread as the dispatcher's main executor
//!
//! An application thread issues work through the dispatcher while the
//! process main thread drains the main queue until the application closes it.
//!
//! Set `RUST_LOG=taskdispatch=trace` to watch individual submissions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use taskdispatch::{
    DispatchConfig, Dispatcher, LockHandle, MainExecutor, Qos, ThreadPool, with_lock,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let config = DispatchConfig::from_env();
    let pool = ThreadPool::new(&config).context("starting background pool")?;
    let main = MainExecutor::new(&config);
    let dispatcher = Dispatcher::new(&pool, &main);

    tracing::info!("taskdispatch v{} with {} workers", taskdispatch::VERSION, pool.worker_count());

    let app = thread::Builder::new()
        .name("app".to_string())
        .spawn(move || {
            let result = run_app(&dispatcher);
            dispatcher.main().close();
            result
        })
        .context("spawning app thread")?;

    main.run().context("draining main queue")?;

    app.join().map_err(|_| anyhow::anyhow!("app thread panicked"))??;
    tracing::info!(completed = main.completed(), "main queue drained");
    Ok(())
}

fn run_app(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    // Background work handing its result to the main thread.
    dispatcher.run_background_then_main_with(
        || {
            thread::sleep(Duration::from_millis(20));
            (1..=10u64).sum::<u64>()
        },
        |sum| tracing::info!(sum, "background result delivered on main"),
        Qos::UserInitiated,
    )?;

    // Join-then-continue, waiting on the returned group.
    let group = dispatcher.wait_then_continue(
        || tracing::info!("first stage"),
        || tracing::info!("continuation after first stage"),
        Qos::Utility,
    )?;
    group.wait();

    // Shared state guarded by a scoped lock across background tasks.
    let lock = Arc::new(LockHandle::new());
    let total = Arc::new(AtomicU64::new(0));
    for _ in 0..4 {
        let (lock, total) = (Arc::clone(&lock), Arc::clone(&total));
        dispatcher.run_background(
            move || {
                for _ in 0..1_000 {
                    with_lock(&lock, || {
                        let value = total.load(Ordering::Relaxed);
                        total.store(value + 1, Ordering::Relaxed);
                    });
                }
            },
            Qos::Background,
        )?;
    }

    // Blocking submissions; the main one queues behind the continuation above.
    let answer = dispatcher.run_background_blocking_with(|| 6 * 7, Qos::Default)?;
    let on_main = dispatcher.run_main_blocking_with({
        let main = dispatcher.main().clone();
        move || main.is_main_thread()
    })?;
    tracing::info!(answer, on_main, "blocking calls returned");

    while !dispatcher.background().is_idle() {
        thread::sleep(Duration::from_millis(5));
    }
    tracing::info!(total = total.load(Ordering::SeqCst), "locked increments");
    Ok(())
}
