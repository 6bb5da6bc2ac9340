//! Terminal transitions shared by completion, failure and cancellation.

use crate::types::{BackgroundTask, TaskCallbacks, TaskFailure, TaskId, TaskOutcome, TaskStatus};
use chrono::Utc;
use conductor_core::redact_secrets;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::warn;

/// A transition that was applied, carrying what observers need to hear
/// about it.
#[derive(Debug)]
pub struct Settlement {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    /// Wall time from start (or submission) to settlement.
    pub elapsed: chrono::Duration,
    callbacks: TaskCallbacks,
}

impl Settlement {
    /// Runs the task's completion or error callback.
    ///
    /// Errors and panics are caught, redacted and logged. Cancellation has
    /// no callback.
    pub fn notify(&self) {
        let outcome = match &self.outcome {
            TaskOutcome::Completed { result } => self.callbacks.on_complete.as_ref().map(|cb| {
                std::panic::catch_unwind(AssertUnwindSafe(|| cb(result)))
            }),
            TaskOutcome::Failed { error } => self
                .callbacks
                .on_error
                .as_ref()
                .map(|cb| std::panic::catch_unwind(AssertUnwindSafe(|| cb(error)))),
            TaskOutcome::Cancelled => None,
        };
        let message = match outcome {
            None | Some(Ok(Ok(()))) => return,
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(panic)) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        warn!(
            task_id = %self.task_id,
            status = %self.outcome.status(),
            error = %redact_secrets(&message),
            "Task callback failed"
        );
    }
}

/// Extracts the message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Stateless terminal-transition logic.
///
/// Every method refuses to touch a task that is already terminal and
/// returns `None` in that case.
pub struct ResultHandler;

impl ResultHandler {
    pub fn complete(task: &mut BackgroundTask, result: serde_json::Value) -> Option<Settlement> {
        if Self::already_terminal(task, TaskStatus::Completed) {
            return None;
        }
        task.status = TaskStatus::Completed;
        task.result = Some(result.clone());
        task.error = None;
        task.progress.progress = 1.0;
        task.progress.current_stage = "completed".into();
        Some(Self::settle(task, TaskOutcome::Completed { result }))
    }

    pub fn fail(task: &mut BackgroundTask, failure: TaskFailure) -> Option<Settlement> {
        if Self::already_terminal(task, TaskStatus::Failed) {
            return None;
        }
        task.status = TaskStatus::Failed;
        task.result = None;
        task.error = Some(failure.clone());
        task.progress.current_stage = "failed".into();
        Some(Self::settle(task, TaskOutcome::Failed { error: failure }))
    }

    /// Cancelled tasks carry neither a result nor an error.
    pub fn cancel(task: &mut BackgroundTask) -> Option<Settlement> {
        if Self::already_terminal(task, TaskStatus::Cancelled) {
            return None;
        }
        task.status = TaskStatus::Cancelled;
        task.result = None;
        task.error = None;
        task.progress.current_stage = "cancelled".into();
        Some(Self::settle(task, TaskOutcome::Cancelled))
    }

    fn already_terminal(task: &BackgroundTask, attempted: TaskStatus) -> bool {
        if task.status.is_terminal() {
            warn!(
                task_id = %task.id,
                status = %task.status,
                attempted = %attempted,
                "Ignoring transition for task that already settled"
            );
            return true;
        }
        false
    }

    fn settle(task: &mut BackgroundTask, outcome: TaskOutcome) -> Settlement {
        task.end_time = Some(Utc::now());
        Settlement {
            task_id: task.id,
            outcome,
            elapsed: task.elapsed(),
            callbacks: task.config.callbacks.clone(),
        }
    }
}

/// Runs a future, turning a panic into `Err(message)`.
pub(crate) async fn catch_panic<F: std::future::Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}
