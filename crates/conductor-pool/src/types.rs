use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of exclusive resource guarded by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// End-to-end test runs (browser, emulator).
    E2e,
    /// Build pipelines.
    Build,
    /// CPU/GPU heavy jobs such as indexing or embedding generation.
    HeavyCompute,
}

impl SlotKind {
    /// Every kind, in report order.
    pub const ALL: [SlotKind; 3] = [SlotKind::E2e, SlotKind::Build, SlotKind::HeavyCompute];
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::E2e => write!(f, "e2e"),
            SlotKind::Build => write!(f, "build"),
            SlotKind::HeavyCompute => write!(f, "heavy_compute"),
        }
    }
}

/// A granted slot. Never mutated after creation; destroyed by release or by
/// stale-lock reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub kind: SlotKind,
    pub orchestrator_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Process that holds the slot; checked for liveness by the sweep.
    pub pid: u32,
}

impl ResourceSlot {
    /// A slot held by the current process.
    pub fn new(kind: SlotKind, orchestrator_id: impl Into<String>) -> Self {
        Self {
            kind,
            orchestrator_id: orchestrator_id.into(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// How long the slot has been held.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.acquired_at
    }
}

/// Occupancy of one slot kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub kind: SlotKind,
    pub active: usize,
    pub max: usize,
    pub waiting: usize,
    pub holders: Vec<ResourceSlot>,
}

/// Diagnostic snapshot of the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub slots: Vec<SlotStatus>,
}

impl PoolStatus {
    /// Status for a single kind.
    pub fn slot(&self, kind: SlotKind) -> Option<&SlotStatus> {
        self.slots.iter().find(|s| s.kind == kind)
    }
}
