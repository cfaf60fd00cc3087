//! Tiered Task Queue
//!
//! One FIFO per [`Qos`] tier. The highest non-empty tier is served first,
//! with a starvation guard so lower tiers still make progress under load.

use std::collections::VecDeque;

use crate::task::{Qos, Task};

/// Consecutive higher-tier pops allowed while a lower tier is waiting
pub const STARVATION_LIMIT: u32 = 16;

/// Task queue with one FIFO per quality-of-service tier
#[derive(Debug, Default)]
pub struct TieredQueue {
    tiers: [VecDeque<Task>; Qos::COUNT],
    /// Pops served from a higher tier while a lower one waited
    streak: u32,
    total_scheduled: u64,
    total_dequeued: u64,
}

impl TieredQueue {
    /// Create new queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task at the given tier
    pub fn push(&mut self, qos: Qos, task: Task) {
        self.tiers[qos.index()].push_back(task);
        self.total_scheduled += 1;
    }

    /// Get next task to run, with the tier it was queued at
    pub fn pop(&mut self) -> Option<(Qos, Task)> {
        let highest = Qos::ALL.into_iter().find(|q| !self.tier(*q).is_empty())?;
        let lowest = Qos::ALL.into_iter().rev().find(|q| !self.tier(*q).is_empty())?;

        let qos = if highest == lowest {
            self.streak = 0;
            highest
        } else if self.streak >= STARVATION_LIMIT {
            self.streak = 0;
            lowest
        } else {
            self.streak += 1;
            highest
        };

        let task = self.tiers[qos.index()].pop_front()?;
        self.total_dequeued += 1;
        Some((qos, task))
    }

    fn tier(&self, qos: Qos) -> &VecDeque<Task> {
        &self.tiers[qos.index()]
    }

    /// Check if any tasks are pending
    pub fn has_pending(&self) -> bool {
        self.tiers.iter().any(|t| !t.is_empty())
    }

    /// Total pending tasks
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Get pending count at each tier
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            user_interactive: self.tier(Qos::UserInteractive).len(),
            user_initiated: self.tier(Qos::UserInitiated).len(),
            default: self.tier(Qos::Default).len(),
            utility: self.tier(Qos::Utility).len(),
            background: self.tier(Qos::Background).len(),
        }
    }

    pub fn total_scheduled(&self) -> u64 {
        self.total_scheduled
    }

    pub fn total_dequeued(&self) -> u64 {
        self.total_dequeued
    }

    /// Remove every pending task
    pub fn drain(&mut self) -> Vec<Task> {
        self.tiers.iter_mut().flat_map(|t| t.drain(..)).collect()
    }
}

/// Pending task counts by tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub user_interactive: usize,
    pub user_initiated: usize,
    pub default: usize,
    pub utility: usize,
    pub background: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.user_interactive + self.user_initiated + self.default + self.utility + self.background
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &'static str) -> Task {
        Task::named(name, || {})
    }

    #[test]
    fn test_priority_order() {
        let mut queue = TieredQueue::new();

        // Add tasks in reverse priority order
        queue.push(Qos::Background, named("background"));
        queue.push(Qos::Utility, named("utility"));
        queue.push(Qos::Default, named("default"));
        queue.push(Qos::UserInitiated, named("initiated"));
        queue.push(Qos::UserInteractive, named("interactive"));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|(_, t)| t.label().unwrap_or_default().to_string())
            .collect();
        assert_eq!(order, ["interactive", "initiated", "default", "utility", "background"]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = TieredQueue::new();
        queue.push(Qos::Default, named("a"));
        queue.push(Qos::Default, named("b"));

        assert_eq!(queue.pop().unwrap().1.label(), Some("a"));
        assert_eq!(queue.pop().unwrap().1.label(), Some("b"));
    }

    #[test]
    fn test_starvation_guard() {
        let mut queue = TieredQueue::new();
        queue.push(Qos::Background, named("starved"));
        for _ in 0..=STARVATION_LIMIT {
            queue.push(Qos::UserInteractive, named("hot"));
        }

        for _ in 0..STARVATION_LIMIT {
            assert_eq!(queue.pop().unwrap().0, Qos::UserInteractive);
        }
        let (qos, task) = queue.pop().unwrap();
        assert_eq!(qos, Qos::Background);
        assert_eq!(task.label(), Some("starved"));
    }

    #[test]
    fn test_stats() {
        let mut queue = TieredQueue::new();
        queue.push(Qos::Utility, named("task1"));
        queue.push(Qos::Utility, named("task2"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_counts().utility, 2);
        assert_eq!(queue.total_scheduled(), 2);

        queue.pop();
        assert_eq!(queue.total_dequeued(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
