use crate::types::{TaskFailure, TaskId};
use tracing::info;

/// Receives success and failure reports for manually resolved tasks.
pub trait AttributionSink: Send + Sync {
    fn record_success(&self, task_id: TaskId, minutes_saved: f64);
    fn record_failure(&self, task_id: TaskId, failure: &TaskFailure, minutes_spent: f64);
}

/// Estimated minutes saved by running work in the background: twice the
/// elapsed wall time.
pub fn estimate_minutes_saved(elapsed: chrono::Duration) -> f64 {
    let minutes = elapsed.num_milliseconds().max(0) as f64 / 60_000.0;
    minutes * 2.0
}

/// [`AttributionSink`] that writes each report to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAttribution;

impl AttributionSink for LogAttribution {
    fn record_success(&self, task_id: TaskId, minutes_saved: f64) {
        info!(task_id = %task_id, minutes_saved, "Background task attributed");
    }

    fn record_failure(&self, task_id: TaskId, failure: &TaskFailure, minutes_spent: f64) {
        info!(
            task_id = %task_id,
            kind = ?failure.kind,
            minutes_spent,
            "Background task failure attributed"
        );
    }
}
