//! Dispatcher Configuration

use serde::{Deserialize, Serialize};

/// Environment variable overriding the background worker count
pub const WORKERS_ENV: &str = "TASKDISPATCH_WORKERS";
/// Environment variable overriding the background queue bound
pub const MAX_PENDING_ENV: &str = "TASKDISPATCH_MAX_PENDING";

/// Executor configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Background worker threads (`None` = available parallelism)
    pub worker_threads: Option<usize>,

    /// Background queue bound (`None` = unbounded)
    pub max_pending: Option<usize>,

    /// Main queue bound (`None` = unbounded)
    pub main_max_pending: Option<usize>,

    /// Worker thread name prefix; workers are named `{prefix}-{id}`
    pub thread_name_prefix: String,

    /// Name of the thread spawned by `MainExecutor::spawn`
    pub main_thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_pending: None,
            main_max_pending: None,
            thread_name_prefix: "taskdispatch-worker".to_string(),
            main_thread_name: "taskdispatch-main".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Defaults overlaid with `TASKDISPATCH_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_usize(WORKERS_ENV) {
            config.worker_threads = Some(workers);
        }
        if let Some(max) = env_usize(MAX_PENDING_ENV) {
            config.max_pending = Some(max);
        }
        config
    }

    /// Set worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_threads = Some(workers);
        self
    }

    /// Bound the background queue
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Bound the main queue
    pub fn with_main_max_pending(mut self, max: usize) -> Self {
        self.main_max_pending = Some(max);
        self
    }

    /// Resolved worker count, never zero
    pub fn resolved_workers(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus).max(1)
    }
}

/// Get the number of available CPU cores
pub fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid dispatcher setting");
            None
        }
    }
}
