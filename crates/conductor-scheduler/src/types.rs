use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Identifier assigned to every submitted task.
pub type TaskId = Uuid;

/// Upper bound on `max_duration_ms`: one hour.
pub const MAX_TASK_DURATION_MS: u64 = 3_600_000;

/// Largest integer an `f64` represents exactly (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Lifecycle state of a background task.
///
/// `Queued -> Running -> {Completed, Failed, Cancelled}`, or `Queued ->
/// Cancelled`. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Dispatch priority. Ordered so that `Critical` is the greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(ConductorError::Validation(format!(
                "unknown priority '{other}' (expected low, normal, high or critical)"
            ))),
        }
    }
}

/// Where the caller would like the task to run. Recorded on the task for
/// callers that route on it; every submitted task runs on the background
/// workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Auto,
    Background,
    Foreground,
}

/// Per-task resource requests. Every field is optional.
///
/// Fields are `f64` because limits arrive from JSON and TOML where integers
/// and floats are indistinguishable; [`ResourceLimits::validate`] rejects the
/// values that do not make sense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU headroom the task needs, as a percentage of the whole host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
    /// Memory the task needs, in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<f64>,
    /// Hard wall-clock limit in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<f64>,
}

impl ResourceLimits {
    pub fn with_max_duration_ms(mut self, ms: f64) -> Self {
        self.max_duration_ms = Some(ms);
        self
    }

    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn with_max_cpu_percent(mut self, percent: f64) -> Self {
        self.max_cpu_percent = Some(percent);
        self
    }

    /// Rejects non-finite, out-of-range or malformed limits.
    pub fn validate(&self) -> ConductorResult<()> {
        if let Some(cpu) = self.max_cpu_percent {
            if !cpu.is_finite() || cpu <= 0.0 || cpu > 100.0 {
                return Err(ConductorError::Validation(format!(
                    "max_cpu_percent must be within (0, 100], got {cpu}"
                )));
            }
        }
        if let Some(memory) = self.max_memory_mb {
            if !memory.is_finite() || memory <= 0.0 {
                return Err(ConductorError::Validation(format!(
                    "max_memory_mb must be a positive finite number, got {memory}"
                )));
            }
        }
        self.max_duration().map(|_| ())
    }

    /// The validated wall-clock limit, if one was requested.
    pub fn max_duration(&self) -> ConductorResult<Option<Duration>> {
        let Some(ms) = self.max_duration_ms else {
            return Ok(None);
        };
        if !ms.is_finite() {
            return Err(ConductorError::Validation(format!(
                "max_duration_ms must be finite, got {ms}"
            )));
        }
        if ms.fract() != 0.0 || ms.abs() > MAX_SAFE_INTEGER {
            return Err(ConductorError::Validation(format!(
                "max_duration_ms must be a safe integer, got {ms}"
            )));
        }
        // -0.0 compares equal to 0.0; check the sign bit explicitly.
        if ms == 0.0 && ms.is_sign_negative() {
            return Err(ConductorError::Validation(
                "max_duration_ms must not be negative zero".into(),
            ));
        }
        if ms <= 0.0 {
            return Err(ConductorError::Validation(format!(
                "max_duration_ms must be positive, got {ms}"
            )));
        }
        if ms > MAX_TASK_DURATION_MS as f64 {
            return Err(ConductorError::Validation(format!(
                "max_duration_ms must not exceed {MAX_TASK_DURATION_MS}, got {ms}"
            )));
        }
        Ok(Some(Duration::from_millis(ms as u64)))
    }
}

/// Return type of completion and error callbacks.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type CompleteCallback = Arc<dyn Fn(&serde_json::Value) -> CallbackResult + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&TaskFailure) -> CallbackResult + Send + Sync>;

/// Observers notified once a task settles.
///
/// Errors and panics raised by a callback are logged (with credentials
/// redacted) and never reach the task or the executor.
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl TaskCallbacks {
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&serde_json::Value) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskFailure) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Submission options for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(skip)]
    pub callbacks: TaskCallbacks,
}

impl ExecutionConfig {
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_callbacks(mut self, callbacks: TaskCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Progress as reported by the task body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub current_stage: String,
}

impl TaskProgress {
    pub fn new(progress: f64, current_stage: impl Into<String>) -> Self {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            progress,
            current_stage: current_stage.into(),
        }
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task body returned an error, or a caller failed it manually.
    Error,
    /// The task ran past its `max_duration_ms`.
    Timeout,
    /// The task body panicked.
    Panic,
    /// Admission can never succeed on this host.
    Rejected,
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// The duration that elapsed, for timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
            duration_ms: None,
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            kind: FailureKind::Timeout,
            message: ConductorError::Timeout { duration_ms }.to_string(),
            duration_ms: Some(duration_ms),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: format!("task panicked: {}", message.into()),
            duration_ms: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            message: message.into(),
            duration_ms: None,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// How a task settled, as observed by `wait_for_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },
    Failed { error: TaskFailure },
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Snapshot of a task as tracked by the executor.
///
/// `result` is set only when `Completed`, `error` only when `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub status: TaskStatus,
    pub config: ExecutionConfig,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub progress: TaskProgress,
}

impl BackgroundTask {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Queued,
            config,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            progress: TaskProgress::new(0.0, "queued"),
        }
    }

    /// Time between start (or submission, if it never started) and the end
    /// of the task, or now if it is still live.
    pub fn elapsed(&self) -> chrono::Duration {
        let from = self.start_time.unwrap_or(self.created_at);
        let to = self.end_time.unwrap_or_else(Utc::now);
        to - from
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn duration(ms: f64) -> ConductorResult<Option<Duration>> {
        ResourceLimits::default().with_max_duration_ms(ms).max_duration()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_duration_accepts_positive_integers() {
        assert_eq!(duration(1000.0).unwrap(), Some(Duration::from_millis(1000)));
        assert_eq!(
            duration(MAX_TASK_DURATION_MS as f64).unwrap(),
            Some(Duration::from_millis(MAX_TASK_DURATION_MS))
        );
        assert_eq!(ResourceLimits::default().max_duration().unwrap(), None);
    }

    #[test]
    fn test_duration_rejects_bad_values() {
        for bad in [
            -0.0,
            0.0,
            -5.0,
            1.5,
            f64::NAN,
            f64::INFINITY,
            3_600_001.0,
            1e300,
        ] {
            assert!(
                matches!(duration(bad), Err(ConductorError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_negative_zero_message() {
        let err = duration(-0.0).unwrap_err();
        assert!(err.to_string().contains("negative zero"));
    }

    #[test]
    fn test_cpu_and_memory_validation() {
        assert!(ResourceLimits::default()
            .with_max_cpu_percent(50.0)
            .with_max_memory_mb(512.0)
            .validate()
            .is_ok());
        assert!(ResourceLimits::default()
            .with_max_cpu_percent(150.0)
            .validate()
            .is_err());
        assert!(ResourceLimits::default()
            .with_max_memory_mb(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(TaskProgress::new(1.7, "x").progress, 1.0);
        assert_eq!(TaskProgress::new(-1.0, "x").progress, 0.0);
        assert_eq!(TaskProgress::new(f64::NAN, "x").progress, 0.0);
    }

    #[test]
    fn test_timeout_failure_message() {
        let failure = TaskFailure::timeout(Duration::from_millis(50));
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.message, "Task timed out after 50ms");
        assert_eq!(failure.duration_ms, Some(50));
    }

    #[test]
    fn test_config_deserializes_without_callbacks() {
        let config: ExecutionConfig = serde_json::from_str(
            r#"{"priority":"high","resource_limits":{"max_duration_ms":500}}"#,
        )
        .unwrap();
        assert_eq!(config.priority, TaskPriority::High);
        assert_eq!(config.mode, ExecutionMode::Auto);
        assert_eq!(
            config.resource_limits.unwrap().max_duration_ms,
            Some(500.0)
        );
        assert!(config.callbacks.on_complete.is_none());
    }

    #[test]
    fn test_outcome_status() {
        let outcome = TaskOutcome::Failed {
            error: TaskFailure::error("boom"),
        };
        assert_eq!(outcome.status(), TaskStatus::Failed);
        let json = serde_json::to_value(&TaskOutcome::Cancelled).unwrap();
        assert_eq!(json["status"], "cancelled");
    }
}
