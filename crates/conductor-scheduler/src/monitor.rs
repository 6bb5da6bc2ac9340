//! Host resource sampling and admission checks.

use crate::config::{
    validate_agent_limit, validate_cpu_threshold, validate_memory_threshold, MonitorConfig,
};
use crate::types::ResourceLimits;
use conductor_core::{
    ConductorError, ConductorResult, CpuUsage, MemoryUsage, RejectionKind, ResourceCheckResult,
    SystemResources,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Raw host figures a [`ResourceProbe`] reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub load_average_1m: f64,
    pub logical_cores: usize,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
}

/// Source of host measurements. Tests substitute a fixed sample.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// [`ResourceProbe`] reading the live host through `sysinfo`.
pub struct SysinfoResourceProbe {
    system: Mutex<System>,
}

impl SysinfoResourceProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoResourceProbe {
    fn sample(&self) -> HostSample {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        HostSample {
            load_average_1m: System::load_average().one,
            logical_cores: std::thread::available_parallelism().map_or(1, |n| n.get()),
            total_memory_mb: sys.total_memory() / BYTES_PER_MB,
            available_memory_mb: sys.available_memory() / BYTES_PER_MB,
        }
    }
}

/// Which thresholds a periodic watch found exceeded.
#[derive(Debug, Clone)]
pub struct ThresholdBreach {
    pub exceeded: Vec<RejectionKind>,
    pub resources: SystemResources,
}

/// Tracks host load and the number of running background tasks, and decides
/// whether another task may start.
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    thresholds: Arc<RwLock<MonitorConfig>>,
    active: Arc<AtomicUsize>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ResourceMonitor {
    /// Monitor sampling the live host.
    pub fn new(config: MonitorConfig) -> ConductorResult<Self> {
        Self::with_probe(config, Arc::new(SysinfoResourceProbe::new()))
    }

    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn ResourceProbe>) -> ConductorResult<Self> {
        config.validate()?;
        Ok(Self {
            probe,
            thresholds: Arc::new(RwLock::new(config)),
            active: Arc::new(AtomicUsize::new(0)),
            watchers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn thresholds(&self) -> MonitorConfig {
        self.thresholds.read().clone()
    }

    pub fn active_background_agents(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of host CPU, memory and the active agent count.
    pub fn get_current_resources(&self) -> SystemResources {
        snapshot(self.probe.as_ref(), self.active_background_agents())
    }

    /// Runs the admission checks in order: agent count, CPU threshold,
    /// memory threshold, then the task's own requested headroom.
    pub fn can_run_background_task(&self, limits: Option<&ResourceLimits>) -> ResourceCheckResult {
        let resources = self.get_current_resources();
        let thresholds = self.thresholds();

        if resources.active_background_agents >= thresholds.max_background_agents {
            return ResourceCheckResult::rejected(
                RejectionKind::AgentLimit,
                format!(
                    "Maximum background agents reached ({}/{})",
                    resources.active_background_agents, thresholds.max_background_agents
                ),
                "Wait for a running background task to finish or raise max_background_agents",
                resources,
            );
        }
        if resources.cpu.usage_percent > thresholds.max_cpu_percent {
            return ResourceCheckResult::rejected(
                RejectionKind::CpuThreshold,
                format!(
                    "CPU usage {:.1}% exceeds threshold {:.1}%",
                    resources.cpu.usage_percent, thresholds.max_cpu_percent
                ),
                "Wait for host load to drop or raise max_cpu_percent",
                resources,
            );
        }
        if resources.memory.used_mb > thresholds.max_memory_mb {
            return ResourceCheckResult::rejected(
                RejectionKind::MemoryThreshold,
                format!(
                    "Memory in use {}MB exceeds threshold {}MB",
                    resources.memory.used_mb, thresholds.max_memory_mb
                ),
                "Free memory on the host or raise max_memory_mb",
                resources,
            );
        }
        match limits {
            Some(limits) => check_task_limits(limits, resources),
            None => ResourceCheckResult::allowed(resources),
        }
    }

    /// The hard-ceiling part of admission: whether the host could ever
    /// satisfy `limits`, independent of current load.
    pub fn check_host_capacity(&self, limits: &ResourceLimits) -> ResourceCheckResult {
        let resources = self.get_current_resources();
        match exceeds_capacity(limits, &resources) {
            Some(rejection) => rejection,
            None => ResourceCheckResult::allowed(resources),
        }
    }

    /// Counts a task as running. Returns the new count.
    pub fn register_background_task(&self) -> usize {
        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(active = count, "Background task registered");
        count
    }

    /// Counts a task as finished, never dropping below zero.
    pub fn unregister_background_task(&self) -> usize {
        let previous = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 0 {
            warn!("Unregister called with no active background tasks");
        }
        let count = previous.saturating_sub(1);
        debug!(active = count, "Background task unregistered");
        count
    }

    pub fn set_max_cpu_percent(&self, percent: f64) -> ConductorResult<()> {
        validate_cpu_threshold(percent)?;
        self.thresholds.write().max_cpu_percent = percent;
        info!(max_cpu_percent = percent, "CPU threshold updated");
        Ok(())
    }

    pub fn set_max_memory_mb(&self, mb: u64) -> ConductorResult<()> {
        validate_memory_threshold(mb)?;
        self.thresholds.write().max_memory_mb = mb;
        info!(max_memory_mb = mb, "Memory threshold updated");
        Ok(())
    }

    pub fn set_max_background_agents(&self, count: usize) -> ConductorResult<()> {
        validate_agent_limit(count)?;
        self.thresholds.write().max_background_agents = count;
        info!(max_background_agents = count, "Agent limit updated");
        Ok(())
    }

    /// Samples the host every `interval` and calls `callback` whenever the
    /// CPU or memory threshold is exceeded.
    pub fn on_threshold_exceeded<F>(&self, interval: Duration, callback: F) -> ConductorResult<()>
    where
        F: Fn(ThresholdBreach) + Send + Sync + 'static,
    {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConductorError::State(
                "resource monitor has been disposed".into(),
            ));
        }
        if interval.is_zero() {
            return Err(ConductorError::Validation(
                "threshold watch interval must be greater than zero".into(),
            ));
        }

        let probe = self.probe.clone();
        let thresholds = self.thresholds.clone();
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let resources = snapshot(probe.as_ref(), active.load(Ordering::Acquire));
                let limits = thresholds.read().clone();
                let mut exceeded = Vec::new();
                if resources.cpu.usage_percent > limits.max_cpu_percent {
                    exceeded.push(RejectionKind::CpuThreshold);
                }
                if resources.memory.used_mb > limits.max_memory_mb {
                    exceeded.push(RejectionKind::MemoryThreshold);
                }
                if !exceeded.is_empty() {
                    warn!(
                        cpu_percent = resources.cpu.usage_percent,
                        used_memory_mb = resources.memory.used_mb,
                        "Resource threshold exceeded"
                    );
                    callback(ThresholdBreach {
                        exceeded,
                        resources,
                    });
                }
            }
        });
        self.watchers.lock().push(handle);
        Ok(())
    }

    /// Stops every threshold watch. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for handle in &watchers {
            handle.abort();
        }
        info!(watchers = watchers.len(), "Resource monitor disposed");
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        for handle in self.watchers.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn snapshot(probe: &dyn ResourceProbe, active_background_agents: usize) -> SystemResources {
    let sample = probe.sample();
    let cores = sample.logical_cores.max(1);
    let usage_percent = if sample.load_average_1m.is_finite() {
        (sample.load_average_1m / cores as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    let total_mb = sample.total_memory_mb;
    let available_mb = sample.available_memory_mb.min(total_mb);
    let used_mb = total_mb - available_mb;
    let memory_percent = if total_mb == 0 {
        0.0
    } else {
        used_mb as f64 / total_mb as f64 * 100.0
    };
    SystemResources {
        cpu: CpuUsage {
            usage_percent,
            cores,
        },
        memory: MemoryUsage {
            total_mb,
            used_mb,
            available_mb,
            usage_percent: memory_percent,
        },
        active_background_agents,
    }
}

fn exceeds_capacity(limits: &ResourceLimits, resources: &SystemResources) -> Option<ResourceCheckResult> {
    let requested = limits.max_memory_mb?;
    if requested > resources.memory.total_mb as f64 {
        return Some(ResourceCheckResult::rejected(
            RejectionKind::ExceedsCapacity,
            format!(
                "Task requests {requested:.0}MB but the host only has {}MB",
                resources.memory.total_mb
            ),
            "Lower the task's max_memory_mb or run it on a larger host",
            *resources,
        ));
    }
    None
}

fn check_task_limits(limits: &ResourceLimits, resources: SystemResources) -> ResourceCheckResult {
    if let Some(rejection) = exceeds_capacity(limits, &resources) {
        return rejection;
    }
    if let Some(requested) = limits.max_cpu_percent {
        let headroom = 100.0 - resources.cpu.usage_percent;
        if requested > headroom {
            return ResourceCheckResult::rejected(
                RejectionKind::CpuHeadroom,
                format!("Task requests {requested:.1}% CPU but only {headroom:.1}% is free"),
                "Wait for host load to drop or lower the task's max_cpu_percent",
                resources,
            );
        }
    }
    if let Some(requested) = limits.max_memory_mb {
        if requested > resources.memory.available_mb as f64 {
            return ResourceCheckResult::rejected(
                RejectionKind::MemoryHeadroom,
                format!(
                    "Task requests {requested:.0}MB but only {}MB is available",
                    resources.memory.available_mb
                ),
                "Wait for memory to free up or lower the task's max_memory_mb",
                resources,
            );
        }
    }
    ResourceCheckResult::allowed(resources)
}
