//! Scoped Locking
//!
//! Mutual exclusion around an arbitrary region of code, for state captured by
//! dispatched tasks. The lock is reentrant: a thread already holding it may
//! enter again.

use parking_lot::ReentrantMutex;

/// A lock guarding no data of its own
#[derive(Default)]
pub struct LockHandle {
    lock: ReentrantMutex<()>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}

impl LockHandle {
    /// Create new lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` while holding the lock
    pub fn with<R>(&self, body: impl FnOnce() -> R) -> R {
        with_lock(self, body)
    }

    /// Check if some thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Run `body` while holding `lock` and return its result.
///
/// The lock is released on every exit path, unwinding included.
pub fn with_lock<R>(lock: &LockHandle, body: impl FnOnce() -> R) -> R {
    let _guard = lock.lock.lock();
    body()
}
