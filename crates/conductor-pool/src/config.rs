use crate::types::SlotKind;
use conductor_core::{ConductorError, ConductorResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Capacities and timings for the [`GlobalResourcePool`](crate::GlobalResourcePool).
///
/// There are deliberately no defaults: every deployment states how many
/// slots its machine supports and how long a holder may go silent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Concurrent end-to-end runs allowed on the host.
    pub max_concurrent_e2e: usize,
    /// Concurrent build pipelines allowed on the host.
    pub max_concurrent_build: usize,
    /// Concurrent heavy-compute jobs allowed on the host.
    pub max_concurrent_heavy_compute: usize,
    /// A slot held longer than this is considered abandoned.
    pub stale_lock_threshold_ms: u64,
    /// How often the stale sweep runs.
    pub stale_check_interval_ms: u64,
    /// How long an acquirer may wait in the queue before failing.
    pub wait_timeout_ms: u64,
    /// Directory holding one record file per held slot. Every process that
    /// should share slots must point at the same directory.
    pub lock_dir: PathBuf,
}

impl PoolConfig {
    /// Checks that every capacity and interval is usable.
    pub fn validate(&self) -> ConductorResult<()> {
        for kind in SlotKind::ALL {
            if self.capacity(kind) == 0 {
                return Err(ConductorError::Validation(format!(
                    "max_concurrent_{kind} must be at least 1"
                )));
            }
        }
        let timings = [
            ("stale_lock_threshold_ms", self.stale_lock_threshold_ms),
            ("stale_check_interval_ms", self.stale_check_interval_ms),
            ("wait_timeout_ms", self.wait_timeout_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(ConductorError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err(ConductorError::Validation(
                "lock_dir must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Slot capacity for `kind`.
    pub fn capacity(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::E2e => self.max_concurrent_e2e,
            SlotKind::Build => self.max_concurrent_build,
            SlotKind::HeavyCompute => self.max_concurrent_heavy_compute,
        }
    }

    pub(crate) fn stale_lock_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_lock_threshold_ms)
    }

    pub(crate) fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    pub(crate) fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
