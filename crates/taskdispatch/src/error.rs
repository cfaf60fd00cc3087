//! Dispatch Errors

/// Errors reported synchronously to the submitting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Task has no body")]
    EmptyTask,

    #[error("Unknown quality-of-service class: {0}")]
    InvalidQos(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("{executor} queue is full ({capacity} pending tasks)")]
    QueueFull {
        executor: &'static str,
        capacity: usize,
    },

    #[error("{0} executor has shut down")]
    ShutDown(&'static str),

    #[error("Main executor is bound to another thread")]
    NotMainThread,

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(err.to_string())
    }
}

/// Dispatch result alias
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
