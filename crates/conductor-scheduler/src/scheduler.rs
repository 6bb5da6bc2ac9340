use crate::monitor::ResourceMonitor;
use crate::queue::{ExecutionQueue, QueueStats, QueuedTask};
use crate::types::TaskId;
use conductor_core::ResourceCheckResult;
use std::sync::Arc;
use tracing::debug;

/// What the scheduler decided about the head of the queue.
#[derive(Debug)]
pub enum Dispatch {
    /// Admitted; the caller should start it now.
    Run(QueuedTask),
    /// The host can never satisfy this task; the caller should fail it.
    Reject(QueuedTask, ResourceCheckResult),
}

/// Pairs the [`ExecutionQueue`] with admission control.
///
/// The head of the queue is re-checked against the monitor on every call.
/// While it is refused for a transient reason, nothing behind it runs
/// either; draining resumes when a running task settles.
pub struct TaskScheduler {
    queue: ExecutionQueue,
    monitor: Arc<ResourceMonitor>,
}

impl TaskScheduler {
    pub fn new(monitor: Arc<ResourceMonitor>) -> Self {
        Self {
            queue: ExecutionQueue::new(),
            monitor,
        }
    }

    pub fn enqueue(&mut self, task: QueuedTask) {
        self.queue.enqueue(task);
    }

    /// Drops a queued task. Returns whether it was found.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        self.queue.remove(task_id).is_some()
    }

    /// Next task allowed to start, if any.
    pub fn next_task(&mut self) -> Option<Dispatch> {
        let head = self.queue.peek()?;
        let check = self
            .monitor
            .can_run_background_task(head.resource_limits.as_ref());
        if check.can_execute {
            return self.queue.dequeue().map(Dispatch::Run);
        }
        if !check.wait_is_viable() {
            return self.queue.dequeue().map(|task| Dispatch::Reject(task, check));
        }
        debug!(
            task_id = %head.task_id,
            reason = check.reason.as_deref().unwrap_or(""),
            "Admission deferred"
        );
        None
    }

    /// Empties the queue in dispatch order.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.queue.drain()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::{HostSample, ResourceProbe};
    use crate::types::{ResourceLimits, TaskPriority};
    use chrono::Utc;
    use conductor_core::RejectionKind;
    use uuid::Uuid;

    struct Idle;

    impl ResourceProbe for Idle {
        fn sample(&self) -> HostSample {
            HostSample {
                load_average_1m: 0.0,
                logical_cores: 8,
                total_memory_mb: 32_768,
                available_memory_mb: 30_000,
            }
        }
    }

    fn scheduler(max_agents: usize) -> (TaskScheduler, Arc<ResourceMonitor>) {
        let monitor = Arc::new(
            ResourceMonitor::with_probe(
                MonitorConfig {
                    max_background_agents: max_agents,
                    ..MonitorConfig::default()
                },
                Arc::new(Idle),
            )
            .unwrap(),
        );
        (TaskScheduler::new(monitor.clone()), monitor)
    }

    fn queued(priority: TaskPriority, limits: Option<ResourceLimits>) -> QueuedTask {
        QueuedTask {
            task_id: Uuid::new_v4(),
            priority,
            resource_limits: limits,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_admits_highest_priority() {
        let (mut s, _) = scheduler(2);
        s.enqueue(queued(TaskPriority::Low, None));
        let high = queued(TaskPriority::High, None);
        s.enqueue(high.clone());
        match s.next_task() {
            Some(Dispatch::Run(t)) => assert_eq!(t.task_id, high.task_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stops_when_agents_exhausted() {
        let (mut s, monitor) = scheduler(1);
        s.enqueue(queued(TaskPriority::Normal, None));
        monitor.register_background_task();
        assert!(s.next_task().is_none());
        assert_eq!(s.len(), 1);
        monitor.unregister_background_task();
        assert!(matches!(s.next_task(), Some(Dispatch::Run(_))));
        assert!(s.is_empty());
    }

    #[test]
    fn test_impossible_task_is_rejected() {
        let (mut s, _) = scheduler(1);
        s.enqueue(queued(
            TaskPriority::Normal,
            Some(ResourceLimits::default().with_max_memory_mb(1e9)),
        ));
        match s.next_task() {
            Some(Dispatch::Reject(_, check)) => {
                assert_eq!(check.rejection, Some(RejectionKind::ExceedsCapacity))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.is_empty());
    }

    #[test]
    fn test_remove() {
        let (mut s, _) = scheduler(1);
        let t = queued(TaskPriority::Normal, None);
        s.enqueue(t.clone());
        assert!(s.remove(t.task_id));
        assert!(!s.remove(t.task_id));
        assert_eq!(s.stats().total, 0);
    }
}
