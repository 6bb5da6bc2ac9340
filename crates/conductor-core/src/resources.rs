use serde::{Deserialize, Serialize};

/// CPU portion of a [`SystemResources`] snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Load-derived usage in percent, clamped to 0–100.
    pub usage_percent: f64,
    /// Logical core count.
    pub cores: usize,
}

/// Memory portion of a [`SystemResources`] snapshot, in megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub usage_percent: f64,
}

/// Point-in-time view of host capacity and in-process background load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub active_background_agents: usize,
}

/// Why an admission check refused a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The concurrent background agent ceiling is reached.
    AgentLimit,
    /// Host CPU usage is above the configured threshold.
    CpuThreshold,
    /// Host memory usage is above the configured threshold.
    MemoryThreshold,
    /// The task's requested CPU share exceeds the current headroom.
    CpuHeadroom,
    /// The task's requested memory exceeds what is currently available.
    MemoryHeadroom,
    /// The task asks for more than the host could ever provide.
    ExceedsCapacity,
}

impl RejectionKind {
    /// Returns true when the condition can clear on its own, so queuing
    /// the task is worthwhile.
    pub fn is_transient(self) -> bool {
        !matches!(self, RejectionKind::ExceedsCapacity)
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionKind::AgentLimit => write!(f, "agent_limit"),
            RejectionKind::CpuThreshold => write!(f, "cpu_threshold"),
            RejectionKind::MemoryThreshold => write!(f, "memory_threshold"),
            RejectionKind::CpuHeadroom => write!(f, "cpu_headroom"),
            RejectionKind::MemoryHeadroom => write!(f, "memory_headroom"),
            RejectionKind::ExceedsCapacity => write!(f, "exceeds_capacity"),
        }
    }
}

/// Outcome of an admission check. Rejections always carry a human-readable
/// reason and suggestion alongside the snapshot they were decided on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCheckResult {
    pub can_execute: bool,
    pub reason: Option<String>,
    pub suggestion: Option<String>,
    pub rejection: Option<RejectionKind>,
    pub resources: SystemResources,
}

impl ResourceCheckResult {
    /// An approving verdict.
    pub fn allowed(resources: SystemResources) -> Self {
        Self {
            can_execute: true,
            reason: None,
            suggestion: None,
            rejection: None,
            resources,
        }
    }

    /// A refusing verdict.
    pub fn rejected(
        kind: RejectionKind,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
        resources: SystemResources,
    ) -> Self {
        Self {
            can_execute: false,
            reason: Some(reason.into()),
            suggestion: Some(suggestion.into()),
            rejection: Some(kind),
            resources,
        }
    }

    /// True when the task may be queued to wait for capacity.
    pub fn wait_is_viable(&self) -> bool {
        self.can_execute || self.rejection.is_some_and(RejectionKind::is_transient)
    }
}
