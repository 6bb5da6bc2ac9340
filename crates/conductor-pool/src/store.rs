use crate::types::{ResourceSlot, SlotKind};
use conductor_core::ConductorResult;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// One record file found in the lock directory.
#[derive(Debug, Clone)]
pub(crate) struct StoredSlot {
    pub path: PathBuf,
    /// `None` while the writer has created the file but not yet filled it,
    /// or when the contents are corrupt.
    pub slot: Option<ResourceSlot>,
    pub modified: Option<SystemTime>,
}

/// Slot records shared by every process on the host.
///
/// Each held slot is a file `<kind>-<index>.json` where `index` is below the
/// kind's capacity. Claiming creates the file with `create_new`, so two
/// processes racing for the same index cannot both win.
pub(crate) struct SlotStore {
    dir: PathBuf,
}

impl SlotStore {
    pub fn open(dir: &Path) -> ConductorResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, kind: SlotKind, index: usize) -> PathBuf {
        self.dir.join(format!("{kind}-{index}.json"))
    }

    /// Write `slot` into the first free index. Ok(false) when every index
    /// below `capacity` is taken.
    pub fn try_claim(&self, slot: &ResourceSlot, capacity: usize) -> ConductorResult<bool> {
        let contents = serde_json::to_vec_pretty(slot)?;
        for index in 0..capacity {
            let path = self.record_path(slot.kind, index);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = file.write_all(&contents) {
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
            debug!(path = %path.display(), "Slot record written");
            return Ok(true);
        }
        Ok(false)
    }

    /// Every record of `kind`, held by this or any other process.
    pub fn records(&self, kind: SlotKind) -> Vec<StoredSlot> {
        let prefix = format!("{kind}-");
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot list slot records");
                return Vec::new();
            }
        };
        let mut records: Vec<StoredSlot> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(".json")
            })
            .map(|entry| {
                let path = entry.path();
                let slot = read_record(&path);
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                StoredSlot {
                    path,
                    slot,
                    modified,
                }
            })
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records
    }

    pub fn active(&self, kind: SlotKind) -> usize {
        self.records(kind).len()
    }

    /// Delete the record of `kind` held by `orchestrator_id` from process
    /// `pid`, returning it.
    pub fn remove_held(
        &self,
        kind: SlotKind,
        orchestrator_id: &str,
        pid: u32,
    ) -> ConductorResult<Option<ResourceSlot>> {
        for record in self.records(kind) {
            let Some(slot) = record.slot else {
                continue;
            };
            if slot.orchestrator_id == orchestrator_id && slot.pid == pid {
                remove_record(&record.path)?;
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Delete `record` if its file still holds what the caller inspected.
    /// Another sweeper may already have reclaimed it and a new holder may
    /// have claimed the index since.
    pub fn remove_if_unchanged(&self, record: &StoredSlot) -> ConductorResult<bool> {
        if read_record(&record.path) != record.slot {
            return Ok(false);
        }
        remove_record(&record.path)?;
        Ok(true)
    }

    /// Delete every record of every kind.
    pub fn clear(&self) -> ConductorResult<usize> {
        let mut removed = 0;
        for kind in SlotKind::ALL {
            for record in self.records(kind) {
                remove_record(&record.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn read_record(path: &Path) -> Option<ResourceSlot> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn remove_record(path: &Path) -> ConductorResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_fills_indexes_up_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();

        assert!(store.try_claim(&ResourceSlot::new(SlotKind::Build, "a"), 2).unwrap());
        assert!(store.try_claim(&ResourceSlot::new(SlotKind::Build, "b"), 2).unwrap());
        assert!(!store.try_claim(&ResourceSlot::new(SlotKind::Build, "c"), 2).unwrap());
        assert_eq!(store.active(SlotKind::Build), 2);
        assert_eq!(store.active(SlotKind::E2e), 0);
        assert!(dir.path().join("build-0.json").exists());
        assert!(dir.path().join("build-1.json").exists());
    }

    #[test]
    fn test_remove_held_matches_owner_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        let slot = ResourceSlot::new(SlotKind::E2e, "owner");
        store.try_claim(&slot, 1).unwrap();

        assert!(store
            .remove_held(SlotKind::E2e, "owner", slot.pid + 1)
            .unwrap()
            .is_none());
        assert!(store.remove_held(SlotKind::E2e, "other", slot.pid).unwrap().is_none());
        assert_eq!(
            store.remove_held(SlotKind::E2e, "owner", slot.pid).unwrap(),
            Some(slot)
        );
        assert_eq!(store.active(SlotKind::E2e), 0);
    }

    #[test]
    fn test_half_written_record_still_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("e2e-0.json"), b"").unwrap();

        assert_eq!(store.active(SlotKind::E2e), 1);
        assert!(store.records(SlotKind::E2e)[0].slot.is_none());
        assert!(!store.try_claim(&ResourceSlot::new(SlotKind::E2e, "late"), 1).unwrap());
    }

    #[test]
    fn test_replaced_record_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).unwrap();
        store.try_claim(&ResourceSlot::new(SlotKind::E2e, "first"), 1).unwrap();
        let seen = store.records(SlotKind::E2e).remove(0);

        fs::remove_file(&seen.path).unwrap();
        store.try_claim(&ResourceSlot::new(SlotKind::E2e, "second"), 1).unwrap();

        assert!(!store.remove_if_unchanged(&seen).unwrap());
        assert_eq!(store.active(SlotKind::E2e), 1);
    }
}
