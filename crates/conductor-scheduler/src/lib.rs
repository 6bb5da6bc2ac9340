//! Admission-controlled background execution for long-running agent work.
//!
//! A coordinating process hands work to the [`BackgroundExecutor`], which
//! queues it by priority, starts it only when the [`ResourceMonitor`] says
//! the host has room, races it against its time limit and keeps its record
//! around long enough for callers to read the outcome.
//!
//! # Main types
//!
//! - [`BackgroundExecutor`]: Task lifecycle, draining, timeouts, cleanup and eviction.
//! - [`TaskScheduler`]: Priority queue gated by admission checks.
//! - [`ExecutionQueue`]: Priority-tiered FIFO of pending tasks.
//! - [`ResourceMonitor`]: Host sampling, thresholds and the active agent count.
//! - [`ResultHandler`]: One-way terminal transitions and callback containment.
//! - [`TaskPayload`] / [`BackgroundJob`]: The work a task runs.

/// Time-saved reporting for manually resolved tasks.
pub mod attribution;
/// Monitor and executor configuration.
pub mod config;
/// Task payloads and the context handed to them.
pub mod context;
/// The background executor.
pub mod executor;
/// Host resource monitoring and admission checks.
pub mod monitor;
/// Priority execution queue.
pub mod queue;
/// Terminal state transitions.
pub mod result;
/// Admission-gated dequeueing.
pub mod scheduler;
/// Task, status and limit types.
pub mod types;

pub use attribution::{estimate_minutes_saved, AttributionSink, LogAttribution};
pub use config::{ExecutorConfig, MonitorConfig};
pub use context::{BackgroundJob, JobResult, ProgressReporter, TaskContext, TaskPayload};
pub use executor::{BackgroundExecutor, BackgroundExecutorBuilder, ExecutorStats};
pub use monitor::{
    HostSample, ResourceMonitor, ResourceProbe, SysinfoResourceProbe, ThresholdBreach,
};
pub use queue::{ExecutionQueue, QueueStats, QueuedTask};
pub use result::{ResultHandler, Settlement};
pub use scheduler::{Dispatch, TaskScheduler};
pub use types::{
    BackgroundTask, CallbackResult, ExecutionConfig, ExecutionMode, FailureKind, ResourceLimits,
    TaskCallbacks, TaskFailure, TaskId, TaskOutcome, TaskPriority, TaskProgress, TaskStatus,
    MAX_TASK_DURATION_MS,
};
