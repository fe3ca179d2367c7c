//! Storage System Selection
//!
//! Picks the storage system receiving the next container of a group.
//! Active systems are used round-robin; systems that stop accepting writes
//! are dropped from the active set, and the set is topped up by walking the
//! group's ring from its ring pointer.
//!
//! Selection is a pure function of a group snapshot: every status and
//! active-set change lands in the returned next state, which the
//! [`GroupRegistry`] commits with a compare-and-swap on the group version.

pub mod registry;

pub use registry::GroupRegistry;

use crate::backend::BackendRegistry;
use crate::domain::ports::StorageBackend;
use crate::domain::system::{SpaceThreshold, StorageSystem, StorageSystemGroup, SystemStatus};
use crate::error::Result;
use crate::metrics::ArchiverMetrics;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Selection Result
// =============================================================================

/// Outcome of one selection over a group snapshot
#[derive(Debug, Clone)]
pub struct Selection {
    /// System receiving the write, if any qualified
    pub selected: Option<String>,
    /// Next state of the group
    pub group: StorageSystemGroup,
    /// Systems whose status changed
    pub changed_systems: Vec<String>,
    /// Whether `group` differs from the snapshot
    pub dirty: bool,
}

impl Selection {
    fn mark(&mut self, system_id: &str) {
        self.dirty = true;
        if !self.changed_systems.iter().any(|s| s == system_id) {
            self.changed_systems.push(system_id.to_string());
        }
    }

    fn set_status(&mut self, system_id: &str, status: SystemStatus) {
        let current = self.group.systems.get_mut(system_id).map(|s| {
            let previous = s.status;
            s.status = status;
            previous
        });
        if let Some(previous) = current {
            if previous != status {
                self.mark(system_id);
            }
        }
    }
}

/// Probe result for one storage system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Eligible,
    Full,
    NotAccessible,
}

// =============================================================================
// Selector
// =============================================================================

/// Round-robin selector with ring top-up
pub struct StorageSystemSelector {
    backends: Arc<BackendRegistry>,
    /// Percentage thresholds resolved to bytes, per system
    resolved_thresholds: DashMap<String, u64>,
    metrics: ArchiverMetrics,
}

impl StorageSystemSelector {
    pub fn new(backends: Arc<BackendRegistry>, metrics: ArchiverMetrics) -> Self {
        Self {
            backends,
            resolved_thresholds: DashMap::new(),
            metrics,
        }
    }

    /// Backends probed by this selector
    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// Select a system for a write of `reserve` bytes
    pub fn select(&self, snapshot: &StorageSystemGroup, cursor: usize, reserve: u64) -> Selection {
        let mut selection = Selection {
            selected: None,
            group: snapshot.clone(),
            changed_systems: Vec::new(),
            dirty: false,
        };

        self.round_robin(&mut selection, cursor, reserve);
        let activated = self.top_up(&mut selection, reserve);
        if selection.selected.is_none() {
            selection.selected = activated;
        }

        match &selection.selected {
            Some(id) => debug!(group = %snapshot.id, system = %id, reserve, "Selected storage system"),
            None => warn!(group = %snapshot.id, reserve, "No storage system can take the write"),
        }
        selection
    }

    /// Steps through the active set from the cursor, dropping ineligible systems
    fn round_robin(&self, selection: &mut Selection, cursor: usize, reserve: u64) {
        if selection.group.active.is_empty() {
            return;
        }
        let mut idx = cursor % selection.group.active.len();

        while !selection.group.active.is_empty() {
            if idx >= selection.group.active.len() {
                idx = 0;
            }
            let id = selection.group.active[idx].clone();

            let verdict = match selection.group.system(&id) {
                Some(system) if system.is_writable_candidate() && system.status == SystemStatus::Ok => {
                    Some(self.check(system, reserve))
                }
                _ => None,
            };

            if verdict == Some(Verdict::Eligible) {
                selection.selected = Some(id);
                return;
            }

            // Same index now holds the next candidate
            selection.group.active.remove(idx);
            selection.mark(&id);
            match verdict {
                Some(Verdict::Full) => selection.set_status(&id, SystemStatus::Full),
                Some(Verdict::NotAccessible) => {
                    selection.set_status(&id, SystemStatus::NotAccessible)
                }
                _ => {}
            }
            self.metrics.deactivations.inc();
            info!(
                group = %selection.group.id,
                system = %id,
                verdict = ?verdict,
                "Deactivated storage system"
            );
        }
    }

    /// Walks the ring once, activating eligible systems up to the parallelism
    ///
    /// Returns the first system activated. The ring pointer moves to its
    /// successor.
    fn top_up(&self, selection: &mut Selection, reserve: u64) -> Option<String> {
        if selection.group.active.len() >= selection.group.parallelism {
            return None;
        }
        let start = selection.group.ring_start()?.to_string();
        let mut current = start.clone();
        let mut first_activated: Option<String> = None;

        loop {
            if selection.group.active.len() >= selection.group.parallelism {
                break;
            }

            let candidate = selection
                .group
                .system(&current)
                .filter(|s| s.is_writable_candidate() && !selection.group.is_active(&s.id))
                .cloned();

            if let Some(system) = candidate {
                match self.check(&system, reserve) {
                    Verdict::Eligible => {
                        selection.group.active.push(system.id.clone());
                        selection.mark(&system.id);
                        selection.set_status(&system.id, SystemStatus::Ok);
                        info!(
                            group = %selection.group.id,
                            system = %system.id,
                            "Activated storage system"
                        );
                        if first_activated.is_none() {
                            first_activated = Some(system.id.clone());
                        }
                    }
                    Verdict::Full => selection.set_status(&system.id, SystemStatus::Full),
                    Verdict::NotAccessible => {
                        selection.set_status(&system.id, SystemStatus::NotAccessible)
                    }
                }
            }

            current = match selection.group.successor(&current) {
                Some(next) if next != start => next.to_string(),
                _ => break,
            };
        }

        if let Some(first) = &first_activated {
            let pointer = selection.group.successor(first).map(str::to_string);
            if pointer != selection.group.next_system_id {
                selection.group.next_system_id = pointer;
                selection.dirty = true;
            }
        }
        first_activated
    }

    /// Probe writability and free space of one system
    fn check(&self, system: &StorageSystem, reserve: u64) -> Verdict {
        let backend = match self.backends.get(&system.id) {
            Ok(b) => b,
            Err(e) => {
                warn!(system = %system.id, error = %e, "No backend for storage system");
                return Verdict::NotAccessible;
            }
        };

        if let Err(e) = backend.check_writable() {
            debug!(system = %system.id, error = %e, "Storage system not writable");
            return Verdict::NotAccessible;
        }

        let usable = match backend.usable_space() {
            Ok(u) => u,
            Err(e) => {
                debug!(system = %system.id, error = %e, "Cannot query usable space");
                return Verdict::NotAccessible;
            }
        };
        let min_free = match self.min_free_bytes(system, backend.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                debug!(system = %system.id, error = %e, "Cannot resolve free space threshold");
                return Verdict::NotAccessible;
            }
        };

        match usable.checked_sub(reserve) {
            Some(left) if left >= min_free => Verdict::Eligible,
            _ => {
                debug!(system = %system.id, usable, reserve, min_free, "Storage system is full");
                Verdict::Full
            }
        }
    }

    fn min_free_bytes(&self, system: &StorageSystem, backend: &dyn StorageBackend) -> Result<u64> {
        match system.min_free_space {
            SpaceThreshold::Absolute(bytes) => Ok(bytes),
            threshold @ SpaceThreshold::Percent(_) => {
                if let Some(bytes) = self.resolved_thresholds.get(&system.id) {
                    return Ok(*bytes);
                }
                let bytes = threshold.resolve(backend.total_space()?);
                self.resolved_thresholds.insert(system.id.clone(), bytes);
                Ok(bytes)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::domain::system::tests::ring_group;
    use std::collections::HashMap;

    /// Selector over one memory backend per system of the test ring
    pub(crate) fn ring_selector(capacity: u64) -> (StorageSystemSelector, HashMap<String, MemoryBackend>) {
        let registry = Arc::new(BackendRegistry::new());
        let mut backends = HashMap::new();
        for id in ["fs1", "fs2", "fs3"] {
            let backend = MemoryBackend::new(id, capacity);
            registry.insert(Arc::new(backend.clone()));
            backends.insert(id.to_string(), backend);
        }
        let selector = StorageSystemSelector::new(registry, ArchiverMetrics::new().unwrap());
        (selector, backends)
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let (selector, _backends) = ring_selector(1000);
        let group = ring_group(3, &["fs1", "fs2", "fs3"]);

        let picked: Vec<_> = (0..3)
            .map(|cursor| selector.select(&group, cursor, 10).selected.unwrap())
            .collect();
        assert_eq!(picked, vec!["fs1", "fs2", "fs3"]);

        let again = selector.select(&group, 3, 10);
        assert_eq!(again.selected.as_deref(), Some("fs1"));
        assert!(!again.dirty);
    }

    #[test]
    fn test_ring_top_up_moves_pointer() {
        let (selector, _backends) = ring_selector(1000);
        let group = ring_group(2, &["fs1"]);

        let selection = selector.select(&group, 0, 10);
        assert_eq!(selection.selected.as_deref(), Some("fs1"));
        assert_eq!(selection.group.active, vec!["fs1", "fs2"]);
        assert_eq!(selection.group.next_system_id.as_deref(), Some("fs3"));
        assert!(selection.dirty);
    }

    #[test]
    fn test_active_set_bounded_by_parallelism() {
        let (selector, _backends) = ring_selector(1000);
        let mut group = ring_group(2, &[]);
        for cursor in 0..10 {
            let selection = selector.select(&group, cursor, 1);
            assert!(selection.group.active.len() <= 2);
            group = selection.group;
        }
        assert_eq!(group.active.len(), 2);
    }

    #[test]
    fn test_full_system_deactivated_until_space_recovers() {
        let (selector, backends) = ring_selector(1000);
        let mut group = ring_group(1, &["fs1"]);
        group.systems.get_mut("fs1").unwrap().min_free_space = SpaceThreshold::Absolute(500);

        backends["fs1"].set_capacity(400);
        let selection = selector.select(&group, 0, 10);
        assert_eq!(selection.selected.as_deref(), Some("fs2"));
        assert_eq!(selection.group.active, vec!["fs2"]);
        assert_eq!(selection.group.systems["fs1"].status, SystemStatus::Full);
        assert!(selection.changed_systems.contains(&"fs1".to_string()));

        // Space returns, but fs1 only comes back through the ring
        backends["fs1"].set_capacity(1000);
        let mut group = selection.group;
        group.active.clear();
        group.next_system_id = Some("fs1".into());
        let selection = selector.select(&group, 0, 10);
        assert_eq!(selection.selected.as_deref(), Some("fs1"));
        assert_eq!(selection.group.systems["fs1"].status, SystemStatus::Ok);
    }

    #[test]
    fn test_unreachable_system_marked_not_accessible() {
        let (selector, backends) = ring_selector(1000);
        let group = ring_group(2, &["fs1", "fs2"]);
        backends["fs2"].set_writable(false);

        let selection = selector.select(&group, 1, 10);
        assert_eq!(selection.selected.as_deref(), Some("fs1"));
        assert_eq!(
            selection.group.systems["fs2"].status,
            SystemStatus::NotAccessible
        );
        // fs3 replaces fs2
        assert_eq!(selection.group.active, vec!["fs1", "fs3"]);
    }

    #[test]
    fn test_exhausted_group_selects_nothing() {
        let (selector, backends) = ring_selector(100);
        let group = ring_group(2, &["fs1"]);
        let selection = selector.select(&group, 0, 500);
        assert!(selection.selected.is_none());
        assert!(selection.group.active.is_empty());
        for id in ["fs1", "fs2", "fs3"] {
            assert_eq!(selection.group.systems[id].status, SystemStatus::Full);
        }
        drop(backends);
    }

    #[test]
    fn test_percent_threshold_resolved_once() {
        let (selector, backends) = ring_selector(1000);
        let mut group = ring_group(1, &["fs1"]);
        group.systems.get_mut("fs1").unwrap().min_free_space = SpaceThreshold::Percent(50.0);

        assert_eq!(selector.select(&group, 0, 400).selected.as_deref(), Some("fs1"));
        assert_eq!(*selector.resolved_thresholds.get("fs1").unwrap(), 500);

        // Capacity change does not re-resolve the cached threshold
        backends["fs1"].set_capacity(2000);
        assert_eq!(*selector.resolved_thresholds.get("fs1").unwrap(), 500);
        assert_eq!(selector.select(&group, 0, 1400).selected.as_deref(), Some("fs1"));
    }
}
