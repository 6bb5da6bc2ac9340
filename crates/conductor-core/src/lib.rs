//! Core types and error definitions for the Conductor background scheduler.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the unified error taxonomy, point-in-time resource snapshots used
//! by admission control, and the redaction helper applied before untrusted
//! text reaches the logs.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`SystemResources`]: Host CPU/memory snapshot plus active agent count.
//! - [`ResourceCheckResult`]: Admission verdict with reason and suggestion.
//! - [`RejectionKind`]: Why admission was refused, and whether waiting helps.

/// Credential redaction for log output.
pub mod redact;
/// Resource snapshot and admission verdict types.
pub mod resources;

pub use redact::redact_secrets;
pub use resources::{CpuUsage, MemoryUsage, RejectionKind, ResourceCheckResult, SystemResources};

// --- Error types ---

/// Top-level error type for Conductor.
///
/// The first four variants form the taxonomy callers match on; the rest wrap
/// admission rejections, pool waits and ambient I/O or parsing failures.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Malformed or out-of-range input (duration bounds, non-finite numbers).
    #[error("Validation error: {0}")]
    Validation(String),

    /// An unknown task identifier.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An illegal state transition or use of a disposed component.
    #[error("State error: {0}")]
    State(String),

    /// A task exceeded its configured `max_duration_ms`.
    #[error("Task timed out after {duration_ms}ms")]
    Timeout {
        /// The configured duration that elapsed.
        duration_ms: u64,
    },

    /// Admission was refused and queuing would not help.
    #[error("Insufficient resources: {}", .0.reason.as_deref().unwrap_or("unknown"))]
    ResourcesUnavailable(Box<ResourceCheckResult>),

    /// Waiting for an exclusive resource slot took longer than allowed.
    #[error("Timed out after {waited_ms}ms waiting for a {kind} slot for orchestrator '{orchestrator_id}'")]
    SlotWaitTimeout {
        /// Slot type that was requested.
        kind: String,
        /// Orchestrator that was waiting.
        orchestrator_id: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Shorthand for the not-found error raised on unknown task ids.
    pub fn task_not_found(task_id: impl std::fmt::Display) -> Self {
        ConductorError::NotFound(format!("task {task_id} not found"))
    }

    /// Returns the rejection details when this is an admission failure.
    pub fn rejection(&self) -> Option<&ResourceCheckResult> {
        match self {
            ConductorError::ResourcesUnavailable(check) => Some(check),
            _ => None,
        }
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_carries_duration() {
        let err = ConductorError::Timeout { duration_ms: 50 };
        assert_eq!(err.to_string(), "Task timed out after 50ms");
    }

    #[test]
    fn test_task_not_found_message() {
        let err = ConductorError::task_not_found("abc");
        assert!(matches!(err, ConductorError::NotFound(_)));
        assert_eq!(err.to_string(), "Not found: task abc not found");
    }

    #[test]
    fn test_rejection_accessor() {
        let check = ResourceCheckResult::rejected(
            RejectionKind::ExceedsCapacity,
            "Task requests 4096MB but host has 2048MB",
            "Lower max_memory_mb",
            SystemResources::default(),
        );
        let err = ConductorError::ResourcesUnavailable(Box::new(check));
        assert!(err.to_string().contains("4096MB"));
        assert_eq!(
            err.rejection().and_then(|c| c.rejection),
            Some(RejectionKind::ExceedsCapacity)
        );
        assert!(ConductorError::State("x".into()).rejection().is_none());
    }
}
