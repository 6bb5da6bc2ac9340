use crate::types::{BackgroundTask, ResourceLimits, TaskId, TaskPriority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Queue entry: just enough of a task to order and admit it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub resource_limits: Option<ResourceLimits>,
    pub enqueued_at: DateTime<Utc>,
}

impl From<&BackgroundTask> for QueuedTask {
    fn from(task: &BackgroundTask) -> Self {
        Self {
            task_id: task.id,
            priority: task.config.priority,
            resource_limits: task.config.resource_limits,
            enqueued_at: Utc::now(),
        }
    }
}

/// Queue depth per priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

/// Priority queue of pending tasks.
///
/// Higher priorities always dequeue first; within one priority, tasks
/// dequeue in submission order.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    tiers: BTreeMap<TaskPriority, VecDeque<QueuedTask>>,
    len: usize,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: QueuedTask) {
        self.tiers.entry(task.priority).or_default().push_back(task);
        self.len += 1;
    }

    /// Removes and returns the highest-priority, earliest-submitted task.
    pub fn dequeue(&mut self) -> Option<QueuedTask> {
        let task = self
            .tiers
            .values_mut()
            .rev()
            .find_map(|tier| tier.pop_front())?;
        self.len -= 1;
        Some(task)
    }

    /// The task [`dequeue`](Self::dequeue) would return next.
    pub fn peek(&self) -> Option<&QueuedTask> {
        self.tiers.values().rev().find_map(|tier| tier.front())
    }

    /// Removes a specific task, wherever it sits in the queue.
    pub fn remove(&mut self, task_id: TaskId) -> Option<QueuedTask> {
        for tier in self.tiers.values_mut() {
            if let Some(pos) = tier.iter().position(|t| t.task_id == task_id) {
                self.len -= 1;
                return tier.remove(pos);
            }
        }
        None
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tiers
            .values()
            .any(|tier| tier.iter().any(|t| t.task_id == task_id))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empties the queue, returning entries in dispatch order.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(task) = self.dequeue() {
            drained.push(task);
        }
        drained
    }

    pub fn stats(&self) -> QueueStats {
        let depth = |p: TaskPriority| self.tiers.get(&p).map_or(0, VecDeque::len);
        QueueStats {
            total: self.len,
            critical: depth(TaskPriority::Critical),
            high: depth(TaskPriority::High),
            normal: depth(TaskPriority::Normal),
            low: depth(TaskPriority::Low),
        }
    }
}
