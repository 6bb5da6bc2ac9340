use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lowest accepted `max_memory_mb` threshold.
pub const MIN_MEMORY_THRESHOLD_MB: u64 = 128;

/// Admission thresholds for the [`ResourceMonitor`](crate::ResourceMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Host CPU usage (percent) above which no new task starts.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    /// Host memory in use (MB) above which no new task starts.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Background tasks allowed to run at once.
    #[serde(default = "default_max_background_agents")]
    pub max_background_agents: usize,
}

fn default_max_cpu_percent() -> f64 {
    80.0
}

fn default_max_memory_mb() -> u64 {
    16_384
}

fn default_max_background_agents() -> usize {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_mb: default_max_memory_mb(),
            max_background_agents: default_max_background_agents(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> ConductorResult<()> {
        validate_cpu_threshold(self.max_cpu_percent)?;
        validate_memory_threshold(self.max_memory_mb)?;
        validate_agent_limit(self.max_background_agents)
    }
}

pub(crate) fn validate_cpu_threshold(percent: f64) -> ConductorResult<()> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return Err(ConductorError::Validation(format!(
            "max_cpu_percent must be a finite value between 0 and 100, got {percent}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_memory_threshold(mb: u64) -> ConductorResult<()> {
    if mb < MIN_MEMORY_THRESHOLD_MB {
        return Err(ConductorError::Validation(format!(
            "max_memory_mb must be at least {MIN_MEMORY_THRESHOLD_MB}, got {mb}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_agent_limit(count: usize) -> ConductorResult<()> {
    if count == 0 {
        return Err(ConductorError::Validation(
            "max_background_agents must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Lifecycle and retention settings for the
/// [`BackgroundExecutor`](crate::BackgroundExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Identity used when releasing global pool slots on shutdown.
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,
    /// How long a terminal task stays readable before cleanup.
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,
    /// Terminal tasks older than this are purged regardless of deferrals.
    #[serde(default = "default_force_cleanup_age_ms")]
    pub force_cleanup_age_ms: u64,
    /// Retained tasks (any status) before bulk eviction kicks in.
    #[serde(default = "default_max_task_history")]
    pub max_task_history: usize,
    /// Terminal tasks evicted per pass once history overflows.
    #[serde(default = "default_eviction_batch_size")]
    pub eviction_batch_size: usize,
    /// How many times `get_task` may push a task's cleanup back.
    #[serde(default = "default_max_cleanup_deferrals")]
    pub max_cleanup_deferrals: u32,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// How long `shutdown` waits for running workers before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_orchestrator_id() -> String {
    format!("orchestrator-{}", std::process::id())
}

fn default_cleanup_delay_ms() -> u64 {
    60_000
}

fn default_force_cleanup_age_ms() -> u64 {
    3_600_000
}

fn default_max_task_history() -> usize {
    1000
}

fn default_eviction_batch_size() -> usize {
    100
}

fn default_max_cleanup_deferrals() -> u32 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            orchestrator_id: default_orchestrator_id(),
            cleanup_delay_ms: default_cleanup_delay_ms(),
            force_cleanup_age_ms: default_force_cleanup_age_ms(),
            max_task_history: default_max_task_history(),
            eviction_batch_size: default_eviction_batch_size(),
            max_cleanup_deferrals: default_max_cleanup_deferrals(),
            sweep_interval_ms: default_sweep_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> ConductorResult<()> {
        if self.orchestrator_id.trim().is_empty() {
            return Err(ConductorError::Validation(
                "orchestrator_id must not be empty".into(),
            ));
        }
        if self.max_task_history == 0 || self.eviction_batch_size == 0 {
            return Err(ConductorError::Validation(
                "max_task_history and eviction_batch_size must be at least 1".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConductorError::Validation(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn cleanup_delay(&self) -> chrono::Duration {
        millis(self.cleanup_delay_ms)
    }

    pub(crate) fn force_cleanup_age(&self) -> chrono::Duration {
        millis(self.force_cleanup_age_ms)
    }

    pub(crate) fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
