//! Group Registry
//!
//! Authoritative, copy-on-write state of every storage system group.
//! Readers clone an `Arc` snapshot; a selection that changes the group is
//! committed only if nobody committed since the snapshot was taken.

use super::StorageSystemSelector;
use crate::domain::system::StorageSystemGroup;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of commit attempts per selection
pub const DEFAULT_COMMIT_ATTEMPTS: usize = 8;

struct GroupSlot {
    current: RwLock<Arc<StorageSystemGroup>>,
    /// Round-robin position, advanced once per selection
    cursor: AtomicUsize,
}

impl GroupSlot {
    fn snapshot(&self) -> Arc<StorageSystemGroup> {
        self.current.read().clone()
    }

    /// Install `next` if the group is still at `expected_version`
    fn compare_and_swap(&self, expected_version: u64, mut next: StorageSystemGroup) -> bool {
        let mut current = self.current.write();
        if current.version != expected_version {
            return false;
        }
        next.version = expected_version + 1;
        *current = Arc::new(next);
        true
    }
}

/// Storage system groups keyed by id
pub struct GroupRegistry {
    groups: DashMap<String, Arc<GroupSlot>>,
    selector: StorageSystemSelector,
    commit_attempts: usize,
}

impl GroupRegistry {
    pub fn new(selector: StorageSystemSelector, commit_attempts: usize) -> Self {
        Self {
            groups: DashMap::new(),
            selector,
            commit_attempts: commit_attempts.max(1),
        }
    }

    /// Selector used for every group
    pub fn selector(&self) -> &StorageSystemSelector {
        &self.selector
    }

    /// Add or replace a group
    pub fn insert(&self, group: StorageSystemGroup) -> Result<()> {
        group.validate()?;
        info!(
            group = %group.id,
            systems = group.systems.len(),
            parallelism = group.parallelism,
            "Registered storage system group"
        );
        self.groups.insert(
            group.id.clone(),
            Arc::new(GroupSlot {
                current: RwLock::new(Arc::new(group)),
                cursor: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    fn slot(&self, group_id: &str) -> Result<Arc<GroupSlot>> {
        self.groups
            .get(group_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::UnknownGroup {
                group: group_id.to_string(),
            })
    }

    /// Current state of a group
    pub fn snapshot(&self, group_id: &str) -> Result<Arc<StorageSystemGroup>> {
        Ok(self.slot(group_id)?.snapshot())
    }

    /// Current state of every group, ordered by id
    pub fn snapshots(&self) -> Vec<Arc<StorageSystemGroup>> {
        let mut all: Vec<_> = self.groups.iter().map(|s| s.value().snapshot()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Select a storage system for a write of `reserve` bytes
    ///
    /// Changes made by the selection are committed with a compare-and-swap on
    /// the group version; a lost race re-runs the selection on a fresh
    /// snapshot, up to the configured number of attempts.
    pub fn select(&self, group_id: &str, reserve: u64) -> Result<Option<String>> {
        let slot = self.slot(group_id)?;
        let cursor = slot.cursor.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=self.commit_attempts {
            let snapshot = slot.snapshot();
            let selection = self.selector.select(&snapshot, cursor, reserve);
            if !selection.dirty {
                return Ok(selection.selected);
            }

            if slot.compare_and_swap(snapshot.version, selection.group) {
                info!(
                    group = %group_id,
                    version = snapshot.version + 1,
                    changed = ?selection.changed_systems,
                    "Committed group state"
                );
                return Ok(selection.selected);
            }
            debug!(group = %group_id, attempt, "Group changed concurrently, selecting again");
        }

        Err(Error::CommitConflict {
            group: group_id.to_string(),
            attempts: self.commit_attempts,
        })
    }

    /// Apply an arbitrary change to a group with the same commit protocol
    pub fn update<F>(&self, group_id: &str, mut change: F) -> Result<Arc<StorageSystemGroup>>
    where
        F: FnMut(&StorageSystemGroup) -> Result<StorageSystemGroup>,
    {
        let slot = self.slot(group_id)?;
        for _ in 0..self.commit_attempts {
            let snapshot = slot.snapshot();
            let next = change(&snapshot)?;
            next.validate()?;
            if slot.compare_and_swap(snapshot.version, next) {
                return Ok(slot.snapshot());
            }
        }
        Err(Error::CommitConflict {
            group: group_id.to_string(),
            attempts: self.commit_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::system::tests::ring_group;
    use crate::domain::system::SystemStatus;
    use crate::backend::{BackendRegistry, MemoryBackend};
    use crate::domain::ports::StorageBackend;
    use crate::metrics::ArchiverMetrics;
    use crate::selector::tests::ring_selector;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::sync::Weak;

    /// Backend whose writability check commits a concurrent group change
    ///
    /// Every interfering check raises the group parallelism to 3, so the
    /// selection that triggered it loses its compare-and-swap.
    struct Interfering {
        inner: MemoryBackend,
        registry: Mutex<Option<Weak<GroupRegistry>>>,
        remaining: AtomicUsize,
    }

    impl StorageBackend for Interfering {
        fn system_id(&self) -> &str {
            self.inner.system_id()
        }
        fn check_writable(&self) -> Result<()> {
            let interfere = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let registry = self.registry.lock().as_ref().and_then(Weak::upgrade);
            if let (true, Some(registry)) = (interfere, registry) {
                registry.update("g1", |g| {
                    let mut next = g.clone();
                    next.parallelism = 3;
                    Ok(next)
                })?;
            }
            self.inner.check_writable()
        }
        fn usable_space(&self) -> Result<u64> {
            self.inner.usable_space()
        }
        fn total_space(&self) -> Result<u64> {
            self.inner.total_space()
        }
        fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>> {
            self.inner.open_write(name)
        }
        fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>> {
            self.inner.open_read(name)
        }
        fn delete(&self, name: &str) -> Result<()> {
            self.inner.delete(name)
        }
        fn exists(&self, name: &str) -> Result<bool> {
            self.inner.exists(name)
        }
    }

    /// Registry over the test ring where `fs1` interferes `times` times
    fn interfering_registry(times: usize, commit_attempts: usize) -> Arc<GroupRegistry> {
        let backends = Arc::new(BackendRegistry::new());
        let fs1 = Arc::new(Interfering {
            inner: MemoryBackend::new("fs1", 1000),
            registry: Mutex::new(None),
            remaining: AtomicUsize::new(times),
        });
        backends.insert(fs1.clone());
        for id in ["fs2", "fs3"] {
            backends.insert(Arc::new(MemoryBackend::new(id, 1000)));
        }

        let selector = StorageSystemSelector::new(backends, ArchiverMetrics::new().unwrap());
        let registry = Arc::new(GroupRegistry::new(selector, commit_attempts));
        registry.insert(ring_group(2, &["fs1"])).unwrap();
        *fs1.registry.lock() = Some(Arc::downgrade(&registry));
        registry
    }

    #[test]
    fn test_select_commits_changes() {
        let (selector, _backends) = ring_selector(1000);
        let registry = GroupRegistry::new(selector, DEFAULT_COMMIT_ATTEMPTS);
        registry.insert(ring_group(2, &["fs1"])).unwrap();

        assert_eq!(registry.select("g1", 10).unwrap().as_deref(), Some("fs1"));
        let group = registry.snapshot("g1").unwrap();
        assert_eq!(group.version, 1);
        assert_eq!(group.active, vec!["fs1", "fs2"]);
        assert_eq!(group.next_system_id.as_deref(), Some("fs3"));

        // Clean selections leave the version alone
        assert_eq!(registry.select("g1", 10).unwrap().as_deref(), Some("fs2"));
        assert_eq!(registry.snapshot("g1").unwrap().version, 1);
    }

    #[test]
    fn test_unknown_group() {
        let (selector, _backends) = ring_selector(1000);
        let registry = GroupRegistry::new(selector, DEFAULT_COMMIT_ATTEMPTS);
        assert_matches!(registry.select("nope", 1), Err(Error::UnknownGroup { .. }));
    }

    #[test]
    fn test_update_bumps_version() {
        let (selector, _backends) = ring_selector(1000);
        let registry = GroupRegistry::new(selector, DEFAULT_COMMIT_ATTEMPTS);
        registry.insert(ring_group(2, &["fs1"])).unwrap();

        let group = registry
            .update("g1", |g| {
                let mut next = g.clone();
                next.systems.get_mut("fs2").unwrap().status = SystemStatus::Full;
                Ok(next)
            })
            .unwrap();
        assert_eq!(group.version, 1);

        // Invalid states are refused
        let err = registry.update("g1", |g| {
            let mut next = g.clone();
            next.parallelism = 0;
            Ok(next)
        });
        assert_matches!(err, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_lost_commit_reselects_on_fresh_snapshot() {
        let registry = interfering_registry(1, DEFAULT_COMMIT_ATTEMPTS);

        assert_eq!(registry.select("g1", 10).unwrap().as_deref(), Some("fs1"));

        // The retry saw parallelism 3 and topped up both remaining systems
        let group = registry.snapshot("g1").unwrap();
        assert_eq!(group.version, 2);
        assert_eq!(group.parallelism, 3);
        assert_eq!(group.active, vec!["fs1", "fs2", "fs3"]);
        assert_eq!(group.next_system_id.as_deref(), Some("fs3"));
    }

    #[test]
    fn test_commit_conflict_after_last_attempt() {
        let registry = interfering_registry(usize::MAX, 1);

        assert_matches!(
            registry.select("g1", 10),
            Err(Error::CommitConflict { attempts: 1, .. })
        );

        // Only the interfering change was committed
        let group = registry.snapshot("g1").unwrap();
        assert_eq!(group.version, 1);
        assert_eq!(group.active, vec!["fs1"]);
    }

    #[test]
    fn test_concurrent_selection_round_robin() {
        let (selector, _backends) = ring_selector(1_000_000);
        let registry = Arc::new(GroupRegistry::new(selector, 64));
        registry.insert(ring_group(3, &[])).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..30)
                        .map(|_| registry.select("g1", 1).unwrap().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }
        let group = registry.snapshot("g1").unwrap();
        assert!(group.active.len() <= group.parallelism);
        assert_eq!(seen.len(), 3);
    }
}
