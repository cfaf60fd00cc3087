//! Completion Groups
//!
//! A [`Group`] counts in-flight tasks and schedules its notify tasks once the
//! count drops to zero. The thread whose decrement observes the transition to
//! zero is the only one that schedules them, so every notify task runs exactly
//! once and never before the last tracked task has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::task::Task;
use crate::thread::Executor;

/// Lifecycle of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// At least one tracked task is in flight
    Open,
    /// The last task finished and notify tasks are being scheduled
    Draining,
    /// Nothing in flight and every notify task has been scheduled
    Closed,
}

/// Schedules one notify task on its target executor
type NotifyEntry = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct NotifyList {
    entries: Vec<NotifyEntry>,
    /// Threads currently scheduling a taken batch
    draining: usize,
}

struct GroupInner {
    pending: AtomicUsize,
    notify: Mutex<NotifyList>,
    idle: Condvar,
}

impl GroupInner {
    /// Run by a thread whose decrement reached zero.
    fn fire(&self) {
        let entries = {
            let mut list = self.notify.lock();
            // Reopened by enter() before the lock was taken: the entries
            // belong to the next time the count reaches zero.
            if self.pending.load(Ordering::Acquire) != 0 {
                return;
            }
            self.idle.notify_all();
            list.draining += 1;
            std::mem::take(&mut list.entries)
        };
        tracing::trace!(notify = entries.len(), "group.fire");
        for entry in entries {
            entry();
        }
        self.notify.lock().draining -= 1;
    }
}

/// Tracks a set of in-flight tasks and runs notify tasks after all finish.
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("pending", &self.pending())
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl Group {
    /// Create an empty group
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                pending: AtomicUsize::new(0),
                notify: Mutex::new(NotifyList::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Track one more in-flight task
    pub fn enter(&self) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one tracked task finished.
    ///
    /// A `leave` without a matching `enter` is ignored.
    pub fn leave(&self) {
        match self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.inner.fire(),
            Ok(_) => {}
            Err(_) => tracing::warn!("group leave without matching enter"),
        }
    }

    /// Run `task` on `executor` as a tracked member of this group.
    ///
    /// The group is left when the task finishes, panics, or is rejected.
    pub fn spawn<E>(&self, executor: &E, task: impl Into<Task>) -> Result<()>
    where
        E: Executor + ?Sized,
    {
        let task = task.into().validate()?;
        self.enter();
        let guard = LeaveGuard(self.clone());
        let tracked = task.wrap(move |body| {
            let _leave = guard;
            body();
        });
        executor.execute(tracked)
    }

    /// Schedule `task` on `executor` once every tracked task has finished.
    ///
    /// On a group with nothing in flight the task is scheduled immediately
    /// and a full executor rejects it here. Otherwise the task's queue slot
    /// is reserved: only an executor that has shut down by then drops it.
    pub fn notify<E>(&self, executor: &E, task: impl Into<Task>) -> Result<()>
    where
        E: Executor + Clone + 'static,
    {
        let task = task.into().validate()?;
        let mut list = self.inner.notify.lock();
        if self.inner.pending.load(Ordering::Acquire) == 0 {
            drop(list);
            return executor.execute(task);
        }

        let executor = executor.clone();
        list.entries.push(Box::new(move || {
            if let Err(err) = executor.execute_follow_up(task) {
                tracing::warn!(executor = executor.name(), %err, "group notify task rejected");
            }
        }));
        Ok(())
    }

    /// Block until nothing is in flight
    pub fn wait(&self) {
        let mut list = self.inner.notify.lock();
        while self.inner.pending.load(Ordering::Acquire) != 0 {
            self.inner.idle.wait(&mut list);
        }
    }

    /// Block until nothing is in flight or `timeout` elapses; `true` if idle
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut list = self.inner.notify.lock();
        while self.inner.pending.load(Ordering::Acquire) != 0 {
            if self.inner.idle.wait_until(&mut list, deadline).timed_out() {
                return self.inner.pending.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Tracked tasks still in flight
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn state(&self) -> GroupState {
        let list = self.inner.notify.lock();
        if self.inner.pending.load(Ordering::Acquire) != 0 {
            GroupState::Open
        } else if list.draining > 0 {
            GroupState::Draining
        } else {
            GroupState::Closed
        }
    }
}

/// Leaves the group when dropped, including while unwinding
struct LeaveGuard(Group);

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use std::sync::atomic::AtomicU32;

    /// Runs tasks inline on the calling thread
    #[derive(Clone)]
    struct Inline;

    impl Executor for Inline {
        fn execute(&self, task: Task) -> Result<()> {
            task.run_detached("inline", None);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "inline"
        }
    }

    /// Rejects everything
    #[derive(Clone)]
    struct Closed;

    impl Executor for Closed {
        fn execute(&self, _task: Task) -> Result<()> {
            Err(DispatchError::ShutDown("closed"))
        }

        fn name(&self) -> &'static str {
            "closed"
        }
    }

    fn counter_task(counter: &Arc<AtomicU32>) -> Task {
        let counter = Arc::clone(counter);
        Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_notify_after_last_leave() {
        let group = Group::new();
        let fired = Arc::new(AtomicU32::new(0));

        group.enter();
        group.enter();
        assert_eq!(group.state(), GroupState::Open);
        group.notify(&Inline, counter_task(&fired)).unwrap();

        group.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        group.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(group.state(), GroupState::Closed);
    }

    #[test]
    fn test_notify_on_idle_group_fires_immediately() {
        let group = Group::new();
        let fired = Arc::new(AtomicU32::new(0));
        group.notify(&Inline, counter_task(&fired)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbalanced_leave_ignored() {
        let group = Group::new();
        group.leave();
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_spawn_leaves_on_panic() {
        let group = Group::new();
        let fired = Arc::new(AtomicU32::new(0));

        group.spawn(&Inline, || panic!("tracked boom")).unwrap();
        assert_eq!(group.pending(), 0);
        group.notify(&Inline, counter_task(&fired)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_leaves_when_rejected() {
        let group = Group::new();
        let err = group.spawn(&Closed, || {}).unwrap_err();
        assert_eq!(err, DispatchError::ShutDown("closed"));
        assert_eq!(group.pending(), 0);
        assert!(group.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_empty_tasks_rejected() {
        let group = Group::new();
        assert_eq!(group.spawn(&Inline, Task::empty()), Err(DispatchError::EmptyTask));
        assert_eq!(group.notify(&Inline, Task::empty()), Err(DispatchError::EmptyTask));
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_wait_blocks_until_leave() {
        let group = Group::new();
        group.enter();

        let leaver = group.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            leaver.leave();
        });

        assert!(!group.wait_timeout(Duration::from_millis(1)));
        group.wait();
        assert_eq!(group.pending(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_reopened_group_holds_notify() {
        let group = Group::new();
        let fired = Arc::new(AtomicU32::new(0));

        // A fire that lost the race against enter() must not run new entries.
        group.enter();
        group.notify(&Inline, counter_task(&fired)).unwrap();
        group.inner.fire();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(group.state(), GroupState::Open);

        group.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(group.state(), GroupState::Closed);
    }

    #[test]
    fn test_state_draining_while_scheduling() {
        let group = Group::new();
        let seen = Arc::new(Mutex::new(None));

        /// Records the group state from inside the notify scheduling step
        #[derive(Clone)]
        struct Recording(Group, Arc<Mutex<Option<GroupState>>>);

        impl Executor for Recording {
            fn execute(&self, task: Task) -> Result<()> {
                *self.1.lock() = Some(self.0.state());
                task.run_detached("recording", None);
                Ok(())
            }

            fn name(&self) -> &'static str {
                "recording"
            }
        }

        group.enter();
        let recorder = Recording(group.clone(), Arc::clone(&seen));
        group.notify(&recorder, Task::new(|| {})).unwrap();
        group.leave();

        assert_eq!(*seen.lock(), Some(GroupState::Draining));
        assert_eq!(group.state(), GroupState::Closed);
    }

    #[test]
    fn test_concurrent_leaves_fire_once() {
        for _ in 0..200 {
            let group = Group::new();
            let fired = Arc::new(AtomicU32::new(0));
            for _ in 0..4 {
                group.enter();
            }
            group.notify(&Inline, counter_task(&fired)).unwrap();

            let leavers: Vec<_> = (0..4)
                .map(|_| {
                    let group = group.clone();
                    std::thread::spawn(move || group.leave())
                })
                .collect();
            for leaver in leavers {
                leaver.join().unwrap();
            }

            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }
}
