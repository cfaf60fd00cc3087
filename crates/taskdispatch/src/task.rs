//! Tasks and Quality of Service
//!
//! A [`Task`] is a deferred, parameterless unit of work. A [`Qos`] tag selects
//! the tier of the background queue that services it.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Task function type
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Quality-of-service classes, lowest tier first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Qos {
    /// Maintenance work the user never waits on
    Background = 0,
    /// Long-running work with user-visible progress
    Utility = 1,
    /// Unclassified work
    #[default]
    Default = 2,
    /// Work the user started and is waiting for
    UserInitiated = 3,
    /// Input handling, animation
    UserInteractive = 4,
}

impl Qos {
    /// Number of tiers
    pub const COUNT: usize = 5;

    /// All tiers, highest first
    pub const ALL: [Qos; Self::COUNT] = [
        Self::UserInteractive,
        Self::UserInitiated,
        Self::Default,
        Self::Utility,
        Self::Background,
    ];

    /// Get tier name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Utility => "utility",
            Self::Default => "default",
            Self::UserInitiated => "user_initiated",
            Self::UserInteractive => "user_interactive",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Qos {
    type Error = DispatchError;

    fn try_from(tier: u8) -> Result<Self> {
        match tier {
            0 => Ok(Self::Background),
            1 => Ok(Self::Utility),
            2 => Ok(Self::Default),
            3 => Ok(Self::UserInitiated),
            4 => Ok(Self::UserInteractive),
            other => Err(DispatchError::InvalidQos(other.to_string())),
        }
    }
}

impl FromStr for Qos {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "background" => Ok(Self::Background),
            "utility" => Ok(Self::Utility),
            "default" => Ok(Self::Default),
            "user_initiated" => Ok(Self::UserInitiated),
            "user_interactive" => Ok(Self::UserInteractive),
            _ => Err(DispatchError::InvalidQos(s.to_string())),
        }
    }
}

/// A unit of work submitted to an executor.
///
/// A task without a body is *empty*. Every submission path rejects empty
/// tasks with [`DispatchError::EmptyTask`] before anything is enqueued.
#[derive(Default)]
pub struct Task {
    body: Option<TaskFn>,
    label: Option<Cow<'static, str>>,
}

impl Task {
    /// Create new task
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            body: Some(Box::new(f)),
            label: None,
        }
    }

    /// Create a labelled task; the label shows up in logs
    pub fn named<F>(label: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            body: Some(Box::new(f)),
            label: Some(label.into()),
        }
    }

    /// Create a task with no body
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap an optional closure; `None` yields an empty task
    pub fn from_option<F>(f: Option<F>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        f.map(Self::new).unwrap_or_default()
    }

    /// Check if the task has no body
    pub fn is_empty(&self) -> bool {
        self.body.is_none()
    }

    /// Task label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Reject empty tasks at the submission boundary
    pub(crate) fn validate(self) -> Result<Self> {
        if self.is_empty() {
            Err(DispatchError::EmptyTask)
        } else {
            Ok(self)
        }
    }

    /// Run the body, catching a panic and returning its message
    pub(crate) fn run(self) -> std::result::Result<(), String> {
        match self.body {
            Some(body) => catch_panic(body),
            None => Ok(()),
        }
    }

    /// Run a fire-and-forget task. Panics are logged and dropped.
    ///
    /// Returns `false` if the body panicked.
    pub(crate) fn run_detached(self, executor: &'static str, qos: Option<Qos>) -> bool {
        let label = self.label.clone();
        match self.run() {
            Ok(()) => true,
            Err(message) => {
                tracing::error!(
                    executor,
                    qos = qos.map(Qos::as_str),
                    task = label.as_deref().unwrap_or("<unnamed>"),
                    %message,
                    "dispatched task panicked"
                );
                false
            }
        }
    }

    /// Replace the body with `f(body)`, keeping the label
    pub(crate) fn wrap<W>(self, f: W) -> Self
    where
        W: FnOnce(TaskFn) + Send + 'static,
    {
        let Self { body, label } = self;
        Self {
            body: body.map(|body| Box::new(move || f(body)) as TaskFn),
            label,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

/// Run `f`, turning a panic into its message.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> std::result::Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// Extract the message carried by a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
