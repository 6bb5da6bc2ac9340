//! Exclusive resource slots shared by every orchestrator on a machine.
//!
//! Some resources have a constraint that lives outside any single process:
//! only one end-to-end browser run should execute on the host at a time, a
//! build pipeline should not be started twice, and so on. The
//! [`GlobalResourcePool`] guards a small number of such slots per
//! [`SlotKind`], queues callers in arrival order when the slots are taken,
//! and reclaims slots whose holder process has died.
//!
//! Held slots are JSON record files in the configured `lock_dir`, created
//! atomically, so separate processes pointing at the same directory exclude
//! each other.
//!
//! # Main types
//!
//! - [`GlobalResourcePool`]: The slot table, FIFO wait queue and stale sweep.
//! - [`PoolConfig`]: Required capacities, timeouts and staleness thresholds.
//! - [`ResourceSlot`]: A granted slot, recorded with holder and pid.
//! - [`ProcessProbe`]: Liveness check used by the stale sweep.

/// Pool configuration.
pub mod config;
/// Process liveness probes.
pub mod liveness;
/// The slot table, wait queue and stale-lock sweep.
pub mod pool;
mod store;
/// Slot and status types.
pub mod types;

pub use config::PoolConfig;
pub use liveness::{ProcessProbe, SysinfoProcessProbe};
pub use pool::GlobalResourcePool;
pub use types::{PoolStatus, ResourceSlot, SlotKind, SlotStatus};
