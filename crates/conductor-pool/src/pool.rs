use crate::config::PoolConfig;
use crate::liveness::{ProcessProbe, SysinfoProcessProbe};
use crate::store::{SlotStore, StoredSlot};
use crate::types::{PoolStatus, ResourceSlot, SlotKind, SlotStatus};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a queued caller re-checks the lock directory for capacity
/// freed by another process.
const CLAIM_RETRY_INTERVAL: Duration = Duration::from_millis(100);

struct Waiter {
    ticket: u64,
    orchestrator_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<ResourceSlot>,
}

#[derive(Default)]
struct PoolState {
    waiters: HashMap<SlotKind, VecDeque<Waiter>>,
    next_ticket: u64,
}

impl PoolState {
    fn waiting(&self, kind: SlotKind) -> usize {
        self.waiters.get(&kind).map_or(0, VecDeque::len)
    }
}

/// Guards exclusive resource slots shared by all orchestrators on the host.
///
/// Held slots live as record files in `lock_dir`, so every process pointing
/// at the same directory sees the same occupancy. Within a process,
/// acquisition is first-come first-served: a caller that finds the slots
/// taken is parked in a FIFO queue and resumed when capacity frees up (a
/// local release, a stale reclamation, or another process releasing), or
/// fails once `wait_timeout_ms` has elapsed.
pub struct GlobalResourcePool {
    config: PoolConfig,
    probe: Arc<dyn ProcessProbe>,
    store: SlotStore,
    state: Mutex<PoolState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalResourcePool {
    /// Create a pool that checks holder liveness through the OS process table.
    pub fn new(config: PoolConfig) -> ConductorResult<Arc<Self>> {
        Self::with_probe(config, Arc::new(SysinfoProcessProbe::new()))
    }

    /// Create a pool with a custom liveness probe.
    pub fn with_probe(config: PoolConfig, probe: Arc<dyn ProcessProbe>) -> ConductorResult<Arc<Self>> {
        config.validate()?;
        let store = SlotStore::open(&config.lock_dir)?;
        info!(
            e2e = config.max_concurrent_e2e,
            build = config.max_concurrent_build,
            heavy_compute = config.max_concurrent_heavy_compute,
            lock_dir = %store.dir().display(),
            "Global resource pool created"
        );
        Ok(Arc::new(Self {
            config,
            probe,
            store,
            state: Mutex::new(PoolState::default()),
            sweeper: Mutex::new(None),
        }))
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a slot of `kind`, waiting in FIFO order if none is free.
    ///
    /// Fails with [`ConductorError::SlotWaitTimeout`] when the wait exceeds
    /// the configured timeout, and with [`ConductorError::State`] if the pool
    /// is reset or cleaned up while the caller is queued.
    pub async fn acquire(&self, kind: SlotKind, orchestrator_id: &str) -> ConductorResult<ResourceSlot> {
        let capacity = self.config.capacity(kind);
        let (ticket, mut rx) = {
            let mut state = self.state.lock();
            if state.waiting(kind) == 0 {
                let slot = ResourceSlot::new(kind, orchestrator_id);
                if self.store.try_claim(&slot, capacity)? {
                    info!(orchestrator_id = %orchestrator_id, kind = %kind, "Slot acquired");
                    return Ok(slot);
                }
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.entry(kind).or_default().push_back(Waiter {
                ticket,
                orchestrator_id: orchestrator_id.to_string(),
                enqueued_at: Instant::now(),
                tx,
            });
            info!(
                orchestrator_id = %orchestrator_id,
                kind = %kind,
                position = state.waiting(kind),
                "Slot busy, waiting in queue"
            );
            (ticket, rx)
        };

        let wait_timeout = self.config.wait_timeout();
        let waited = tokio::time::timeout(wait_timeout, async {
            let mut retry = tokio::time::interval(CLAIM_RETRY_INTERVAL);
            retry.tick().await;
            loop {
                tokio::select! {
                    granted = &mut rx => return granted,
                    _ = retry.tick() => self.grant_waiters(kind),
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(ConductorError::State(format!(
                "resource pool was cleared while waiting for a {kind} slot"
            ))),
            Err(_) => {
                let still_queued = {
                    let mut state = self.state.lock();
                    match state.waiters.get_mut(&kind) {
                        Some(queue) => {
                            let before = queue.len();
                            queue.retain(|w| w.ticket != ticket);
                            queue.len() != before
                        }
                        None => false,
                    }
                };
                if still_queued {
                    warn!(
                        orchestrator_id = %orchestrator_id,
                        kind = %kind,
                        waited_ms = wait_timeout.as_millis() as u64,
                        "Gave up waiting for slot"
                    );
                    return Err(ConductorError::SlotWaitTimeout {
                        kind: kind.to_string(),
                        orchestrator_id: orchestrator_id.to_string(),
                        waited_ms: wait_timeout.as_millis() as u64,
                    });
                }
                // Granted in the same instant the timer fired.
                rx.try_recv().map_err(|_| {
                    ConductorError::State(format!(
                        "resource pool was cleared while waiting for a {kind} slot"
                    ))
                })
            }
        }
    }

    /// Hands free capacity to queued callers in arrival order.
    fn grant_waiters(&self, kind: SlotKind) {
        let capacity = self.config.capacity(kind);
        let mut state = self.state.lock();
        loop {
            let Some(queue) = state.waiters.get_mut(&kind) else {
                return;
            };
            let Some(front) = queue.front() else {
                return;
            };
            if front.tx.is_closed() {
                debug!(orchestrator_id = %front.orchestrator_id, kind = %kind, "Skipping abandoned slot waiter");
                queue.pop_front();
                continue;
            }
            let slot = ResourceSlot::new(kind, front.orchestrator_id.clone());
            match self.store.try_claim(&slot, capacity) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Cannot write slot record");
                    return;
                }
            }
            let Some(waiter) = queue.pop_front() else {
                return;
            };
            let waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64;
            if waiter.tx.send(slot.clone()).is_ok() {
                info!(
                    orchestrator_id = %slot.orchestrator_id,
                    kind = %kind,
                    waited_ms,
                    "Slot granted to waiter"
                );
            } else if let Err(e) = self.store.remove_held(kind, &slot.orchestrator_id, slot.pid) {
                warn!(kind = %kind, error = %e, "Cannot remove slot record of departed waiter");
            }
        }
    }

    /// Release the slot of `kind` held by `orchestrator_id` in this process.
    /// Returns false when no such slot is held.
    pub fn release(&self, kind: SlotKind, orchestrator_id: &str) -> bool {
        let slot = match self.store.remove_held(kind, orchestrator_id, std::process::id()) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                warn!(orchestrator_id = %orchestrator_id, kind = %kind, "Release without a held slot");
                return false;
            }
            Err(e) => {
                warn!(orchestrator_id = %orchestrator_id, kind = %kind, error = %e, "Cannot remove slot record");
                return false;
            }
        };
        info!(
            orchestrator_id = %orchestrator_id,
            kind = %kind,
            held_ms = slot.age().num_milliseconds(),
            "Slot released"
        );
        self.grant_waiters(kind);
        true
    }

    /// Release every slot held by `orchestrator_id` in this process, of any kind.
    pub fn release_all(&self, orchestrator_id: &str) -> usize {
        let pid = std::process::id();
        let held: Vec<SlotKind> = self
            .held_by(orchestrator_id)
            .into_iter()
            .filter(|s| s.pid == pid)
            .map(|s| s.kind)
            .collect();
        held.into_iter()
            .filter(|kind| self.release(*kind, orchestrator_id))
            .count()
    }

    /// Non-blocking check: could `count` more slots of `kind` be granted now?
    pub fn can_run(&self, kind: SlotKind, count: usize) -> bool {
        self.store.active(kind) + count <= self.config.capacity(kind)
    }

    /// Slots currently held by `orchestrator_id`, in any process.
    pub fn held_by(&self, orchestrator_id: &str) -> Vec<ResourceSlot> {
        SlotKind::ALL
            .into_iter()
            .flat_map(|kind| self.store.records(kind))
            .filter_map(|record| record.slot)
            .filter(|s| s.orchestrator_id == orchestrator_id)
            .collect()
    }

    /// Acquire the end-to-end test slot.
    pub async fn acquire_e2e_slot(&self, orchestrator_id: &str) -> ConductorResult<ResourceSlot> {
        self.acquire(SlotKind::E2e, orchestrator_id).await
    }

    /// Release the end-to-end test slot.
    pub fn release_e2e_slot(&self, orchestrator_id: &str) -> bool {
        self.release(SlotKind::E2e, orchestrator_id)
    }

    /// Could `count` end-to-end runs start right now?
    pub fn can_run_e2e(&self, count: usize) -> bool {
        self.can_run(SlotKind::E2e, count)
    }

    /// Whether `record` is abandoned: its holder process is gone, or it is
    /// older than the staleness threshold.
    fn is_stale(&self, record: &StoredSlot, liveness: &mut HashMap<u32, bool>) -> bool {
        let threshold = self.config.stale_lock_threshold();
        match &record.slot {
            Some(slot) => {
                let expired = slot.age().to_std().map(|age| age > threshold).unwrap_or(false);
                expired
                    || !*liveness
                        .entry(slot.pid)
                        .or_insert_with(|| self.probe.is_alive(slot.pid))
            }
            // Unreadable records are only trusted for as long as a holder
            // could legitimately keep one.
            None => record
                .modified
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .is_some_and(|age| age > threshold),
        }
    }

    /// Reclaim slots whose holder process is gone or that exceeded the
    /// staleness threshold, then hand the capacity to queued callers.
    pub fn sweep_stale_slots(&self) -> Vec<ResourceSlot> {
        let mut liveness: HashMap<u32, bool> = HashMap::new();
        let mut reclaimed = Vec::new();
        for kind in SlotKind::ALL {
            for record in self.store.records(kind) {
                if !self.is_stale(&record, &mut liveness) {
                    continue;
                }
                match self.store.remove_if_unchanged(&record) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(path = %record.path.display(), error = %e, "Cannot remove stale slot record");
                        continue;
                    }
                }
                match record.slot {
                    Some(slot) => {
                        warn!(
                            orchestrator_id = %slot.orchestrator_id,
                            kind = %slot.kind,
                            pid = slot.pid,
                            held_ms = slot.age().num_milliseconds(),
                            "Reclaimed stale slot"
                        );
                        reclaimed.push(slot);
                    }
                    None => warn!(path = %record.path.display(), "Removed unreadable slot record"),
                }
            }
        }
        for kind in SlotKind::ALL {
            self.grant_waiters(kind);
        }
        reclaimed
    }

    /// Start the periodic stale sweep. A second call while one is running
    /// is a no-op.
    pub fn start_stale_sweep(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.stale_check_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let reclaimed = pool.sweep_stale_slots();
                if !reclaimed.is_empty() {
                    debug!(count = reclaimed.len(), "Stale sweep reclaimed slots");
                }
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "Stale slot sweep started");
    }

    /// Occupancy per slot kind, across every process sharing the lock
    /// directory. `waiting` counts this process's queue only.
    pub fn get_status(&self) -> PoolStatus {
        let slots = SlotKind::ALL
            .into_iter()
            .map(|kind| {
                let records = self.store.records(kind);
                SlotStatus {
                    kind,
                    active: records.len(),
                    max: self.config.capacity(kind),
                    waiting: self.state.lock().waiting(kind),
                    holders: records.into_iter().filter_map(|r| r.slot).collect(),
                }
            })
            .collect();
        PoolStatus { slots }
    }

    /// Human-readable occupancy report for diagnostics.
    pub fn generate_report(&self) -> String {
        let status = self.get_status();
        let mut report = String::from("Global Resource Pool\n");
        for slot in &status.slots {
            report.push_str(&format!(
                "  {}: {}/{} active, {} waiting\n",
                slot.kind, slot.active, slot.max, slot.waiting
            ));
            for holder in &slot.holders {
                report.push_str(&format!(
                    "    - {} (pid {}, held {}s)\n",
                    holder.orchestrator_id,
                    holder.pid,
                    holder.age().num_seconds()
                ));
            }
        }
        report
    }

    /// Stop the stale sweep and fail every queued caller. Held slots are
    /// kept until their owners release them. Safe to call more than once.
    pub fn cleanup(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            debug!("Stale slot sweep stopped");
        }
        let dropped: usize = {
            let mut state = self.state.lock();
            let count = state.waiters.values().map(VecDeque::len).sum();
            state.waiters.clear();
            count
        };
        if dropped > 0 {
            info!(waiters = dropped, "Resource pool cleanup failed pending waiters");
        }
    }

    /// Forget every waiter and delete every slot record in the lock
    /// directory. Intended for test isolation when a single directory is
    /// shared across cases.
    pub fn reset_for_test(&self) {
        self.cleanup();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Cannot clear slot records");
        }
    }
}

impl Drop for GlobalResourcePool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
