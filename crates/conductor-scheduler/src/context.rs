use crate::types::{TaskId, TaskProgress};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// What a task body returns: a JSON result or any error.
pub type JobResult = Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>>;

type ProgressSink = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// A unit of background work with a name of its own.
///
/// Implement this for reusable jobs; one-off closures go through
/// [`TaskPayload::from_fn`].
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Runs the job. Long-running jobs should watch
    /// [`TaskContext::cancelled`] and return early.
    async fn execute(&self, ctx: TaskContext) -> JobResult;
}

/// The work a task performs.
pub enum TaskPayload {
    Function(Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, JobResult> + Send>),
    Job(Arc<dyn BackgroundJob>),
}

impl TaskPayload {
    /// Wraps an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        TaskPayload::Function(Box::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn from_job(job: Arc<dyn BackgroundJob>) -> Self {
        TaskPayload::Job(job)
    }

    pub(crate) fn run(self, ctx: TaskContext) -> BoxFuture<'static, JobResult> {
        match self {
            TaskPayload::Function(f) => f(ctx),
            TaskPayload::Job(job) => Box::pin(async move { job.execute(ctx).await }),
        }
    }
}

impl std::fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPayload::Function(_) => f.write_str("TaskPayload::Function"),
            TaskPayload::Job(_) => f.write_str("TaskPayload::Job"),
        }
    }
}

/// Publishes progress for one task. Reports after cancellation are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: ProgressSink,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub(crate) fn new(sink: ProgressSink, cancel: CancellationToken) -> Self {
        Self { sink, cancel }
    }

    /// Records `progress` (clamped to `[0, 1]`) and the current stage.
    pub fn report(&self, progress: f64, stage: impl Into<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        (self.sink)(TaskProgress::new(progress, stage));
    }
}

/// Handed to every task body.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            task_id,
            cancel,
            progress,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// True once the task was cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled or times out.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn report_progress(&self, progress: f64, stage: impl Into<String>) {
        self.progress.report(progress, stage);
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }
}
