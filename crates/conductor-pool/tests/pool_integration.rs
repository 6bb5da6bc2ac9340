//! Cross-caller behaviour of the global resource pool: FIFO hand-off between
//! waiting orchestrators, exclusion between pool instances sharing a lock
//! directory, and reclamation of slots abandoned by dead processes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::ConductorError;
use conductor_pool::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Liveness probe whose answer the test controls.
#[derive(Default)]
struct ScriptedProbe {
    dead: Mutex<HashSet<u32>>,
}

impl ScriptedProbe {
    fn kill(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }
}

impl ProcessProbe for ScriptedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}

fn config(dir: &TempDir, stale_check_interval_ms: u64) -> PoolConfig {
    PoolConfig {
        max_concurrent_e2e: 1,
        max_concurrent_build: 1,
        max_concurrent_heavy_compute: 1,
        stale_lock_threshold_ms: 600_000,
        stale_check_interval_ms,
        wait_timeout_ms: 5_000,
        lock_dir: dir.path().to_path_buf(),
    }
}

fn scripted_pool(dir: &TempDir) -> Arc<GlobalResourcePool> {
    GlobalResourcePool::with_probe(config(dir, 30_000), Arc::new(ScriptedProbe::default())).unwrap()
}

/// Pid of a process that has already exited and been reaped.
fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("sh")
        .args(["-c", "true"])
        .spawn()
        .unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

async fn wait_for_waiters(pool: &GlobalResourcePool, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.get_status().slot(SlotKind::E2e).unwrap().waiting < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("waiters never queued");
}

// ---------------------------------------------------------------------------
// 1. FIFO fairness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn release_grants_slot_to_earliest_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let pool = scripted_pool(&dir);

    pool.acquire_e2e_slot("orch-a").await.unwrap();

    let b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("orch-b").await })
    };
    wait_for_waiters(&pool, 1).await;

    let c = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("orch-c").await })
    };
    wait_for_waiters(&pool, 2).await;

    assert!(pool.release_e2e_slot("orch-a"));
    let granted = b.await.unwrap().unwrap();
    assert_eq!(granted.orchestrator_id, "orch-b");

    // C is still queued behind B.
    let status = pool.get_status();
    let e2e = status.slot(SlotKind::E2e).unwrap();
    assert_eq!(e2e.active, 1);
    assert_eq!(e2e.waiting, 1);
    assert!(!c.is_finished());

    assert!(pool.release_e2e_slot("orch-b"));
    let granted = c.await.unwrap().unwrap();
    assert_eq!(granted.orchestrator_id, "orch-c");
}

#[tokio::test]
async fn newcomer_does_not_jump_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let pool = scripted_pool(&dir);
    pool.acquire_e2e_slot("orch-a").await.unwrap();

    let b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("orch-b").await })
    };
    wait_for_waiters(&pool, 1).await;

    pool.release_e2e_slot("orch-a");
    // Slot went straight to B; a late caller must wait behind it.
    assert!(!pool.can_run_e2e(1));
    assert_eq!(b.await.unwrap().unwrap().orchestrator_id, "orch-b");
}

#[tokio::test]
async fn abandoned_waiter_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let pool = scripted_pool(&dir);
    pool.acquire_e2e_slot("orch-a").await.unwrap();

    let b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("orch-b").await })
    };
    wait_for_waiters(&pool, 1).await;
    let c = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("orch-c").await })
    };
    wait_for_waiters(&pool, 2).await;

    b.abort();
    let _ = b.await;

    pool.release_e2e_slot("orch-a");
    assert_eq!(c.await.unwrap().unwrap().orchestrator_id, "orch-c");
    assert!(pool.held_by("orch-b").is_empty());
}

// ---------------------------------------------------------------------------
// 2. Stale lock reclamation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_holder_is_reclaimed_by_manual_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(ScriptedProbe::default());
    let pool = GlobalResourcePool::with_probe(config(&dir, 30_000), probe.clone()).unwrap();

    let held = pool.acquire_e2e_slot("crashed").await.unwrap();
    assert!(pool.sweep_stale_slots().is_empty());

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("survivor").await })
    };
    wait_for_waiters(&pool, 1).await;

    probe.kill(held.pid);
    let reclaimed = pool.sweep_stale_slots();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].orchestrator_id, "crashed");

    let granted = waiter.await.unwrap().unwrap();
    assert_eq!(granted.orchestrator_id, "survivor");
}

#[tokio::test]
async fn periodic_sweep_grants_within_one_interval() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(ScriptedProbe::default());
    let pool = GlobalResourcePool::with_probe(config(&dir, 25), probe.clone()).unwrap();
    pool.start_stale_sweep();

    let held = pool.acquire_e2e_slot("crashed").await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_e2e_slot("survivor").await })
    };
    wait_for_waiters(&pool, 1).await;
    probe.kill(held.pid);

    let granted = tokio::time::timeout(Duration::from_millis(500), waiter)
        .await
        .expect("sweep did not reclaim the slot")
        .unwrap()
        .unwrap();
    assert_eq!(granted.orchestrator_id, "survivor");
    pool.cleanup();
}

#[tokio::test]
async fn timed_out_waiter_leaves_queue_clean() {
    let dir = tempfile::tempdir().unwrap();
    let pool = GlobalResourcePool::with_probe(
        PoolConfig {
            wait_timeout_ms: 30,
            ..config(&dir, 30_000)
        },
        Arc::new(ScriptedProbe::default()),
    )
    .unwrap();
    pool.acquire_e2e_slot("orch-a").await.unwrap();
    let err = pool.acquire_e2e_slot("orch-b").await.unwrap_err();
    assert!(matches!(err, ConductorError::SlotWaitTimeout { .. }));

    pool.release_e2e_slot("orch-a");
    assert!(pool.can_run_e2e(1));
    assert!(pool.held_by("orch-b").is_empty());
}

#[tokio::test]
async fn exited_holder_is_reclaimed_with_os_liveness() {
    let dir = tempfile::tempdir().unwrap();
    let pool = GlobalResourcePool::new(config(&dir, 30_000)).unwrap();

    // A record left behind by a holder that exited without releasing.
    let orphan = ResourceSlot {
        pid: exited_pid(),
        ..ResourceSlot::new(SlotKind::E2e, "crashed")
    };
    std::fs::write(
        dir.path().join("e2e-0.json"),
        serde_json::to_vec(&orphan).unwrap(),
    )
    .unwrap();
    assert!(!pool.can_run_e2e(1));
    assert_eq!(pool.held_by("crashed"), vec![orphan.clone()]);

    let reclaimed = pool.sweep_stale_slots();
    assert_eq!(reclaimed, vec![orphan]);
    assert!(pool.can_run_e2e(1));

    // Our own live slot survives the same sweep.
    pool.acquire_e2e_slot("alive").await.unwrap();
    assert!(pool.sweep_stale_slots().is_empty());
    assert_eq!(pool.held_by("alive").len(), 1);
}

// ---------------------------------------------------------------------------
// 3. Pool instances sharing a lock directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_instance_sees_slot_held_by_first() {
    let dir = tempfile::tempdir().unwrap();
    let first = scripted_pool(&dir);
    let second = GlobalResourcePool::with_probe(
        PoolConfig {
            wait_timeout_ms: 150,
            ..config(&dir, 30_000)
        },
        Arc::new(ScriptedProbe::default()),
    )
    .unwrap();

    first.acquire_e2e_slot("orch-a").await.unwrap();
    assert!(!second.can_run_e2e(1));
    assert_eq!(second.get_status().slot(SlotKind::E2e).unwrap().active, 1);
    assert_eq!(second.held_by("orch-a").len(), 1);

    let err = second.acquire_e2e_slot("orch-b").await.unwrap_err();
    assert!(matches!(err, ConductorError::SlotWaitTimeout { .. }));

    // orch-b never got the slot, so there is nothing to release.
    assert!(!second.release_e2e_slot("orch-b"));
    assert!(!first.can_run_e2e(1));
}

#[tokio::test]
async fn waiter_in_second_instance_acquires_after_first_releases() {
    let dir = tempfile::tempdir().unwrap();
    let first = scripted_pool(&dir);
    let second = scripted_pool(&dir);

    first.acquire_e2e_slot("orch-a").await.unwrap();
    let waiter = {
        let second = second.clone();
        tokio::spawn(async move { second.acquire_e2e_slot("orch-b").await })
    };
    wait_for_waiters(&second, 1).await;

    assert!(first.release_e2e_slot("orch-a"));
    let granted = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("second instance never noticed the release")
        .unwrap()
        .unwrap();
    assert_eq!(granted.orchestrator_id, "orch-b");

    // Now the first instance is the one locked out.
    assert!(!first.can_run_e2e(1));
    assert_eq!(first.held_by("orch-b").len(), 1);
}

#[tokio::test]
async fn concurrent_instances_never_exceed_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let pools: Vec<_> = (0..4).map(|_| scripted_pool(&dir)).collect();

    let attempts: Vec<_> = pools
        .iter()
        .enumerate()
        .map(|(i, pool)| {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(50),
                    pool.acquire_e2e_slot(&format!("orch-{i}")),
                )
                .await
            })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        if let Ok(Ok(_)) = attempt.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(pools[0].get_status().slot(SlotKind::E2e).unwrap().active, 1);
}
