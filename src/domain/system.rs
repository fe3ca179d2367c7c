//! Storage System Types
//!
//! Storage systems, their ring links, and the groups that select among them.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// System Status
// =============================================================================

/// Writability status of a storage system, maintained by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    #[default]
    Ok,
    Full,
    NotAccessible,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemStatus::Ok => write!(f, "ok"),
            SystemStatus::Full => write!(f, "full"),
            SystemStatus::NotAccessible => write!(f, "not_accessible"),
        }
    }
}

/// Availability of a stored object, signalled by sibling marker files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Nearline,
    Offline,
    Unavailable,
}

// =============================================================================
// Space Threshold
// =============================================================================

/// Minimum free space, either in bytes or relative to the total capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SpaceThreshold {
    Absolute(u64),
    Percent(f64),
}

impl SpaceThreshold {
    /// Resolve the threshold to bytes against a total capacity
    pub fn resolve(&self, total_bytes: u64) -> u64 {
        match self {
            SpaceThreshold::Absolute(bytes) => *bytes,
            SpaceThreshold::Percent(pct) => (total_bytes as f64 * pct / 100.0) as u64,
        }
    }

    /// Whether resolving needs the total capacity of the medium
    pub fn is_relative(&self) -> bool {
        matches!(self, SpaceThreshold::Percent(_))
    }
}

impl Default for SpaceThreshold {
    fn default() -> Self {
        SpaceThreshold::Absolute(0)
    }
}

impl FromStr for SpaceThreshold {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| Error::CapacityParse(format!("invalid percentage: {}", s)))?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::CapacityParse(format!(
                    "percentage out of range: {}",
                    s
                )));
            }
            return Ok(SpaceThreshold::Percent(pct));
        }
        parse_capacity(s).map(SpaceThreshold::Absolute)
    }
}

impl TryFrom<String> for SpaceThreshold {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SpaceThreshold> for String {
    fn from(t: SpaceThreshold) -> Self {
        t.to_string()
    }
}

impl fmt::Display for SpaceThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceThreshold::Absolute(bytes) => write!(f, "{}", bytes),
            SpaceThreshold::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

// =============================================================================
// Storage System
// =============================================================================

/// One storage medium participating in a group's ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSystem {
    /// Identity within the group
    pub id: String,
    /// Location of the medium (`file:///...`, `mem://...`)
    pub uri: String,
    /// Read-only systems never receive writes
    pub read_only: bool,
    /// Uninstalled systems are skipped entirely
    pub installed: bool,
    /// Current writability status
    pub status: SystemStatus,
    /// Minimum free space to keep on the medium
    pub min_free_space: SpaceThreshold,
    /// Successor in the group's ring
    pub next_system_id: String,
}

impl StorageSystem {
    /// Whether the system may ever be written to
    pub fn is_writable_candidate(&self) -> bool {
        self.installed && !self.read_only
    }
}

// =============================================================================
// Storage System Group
// =============================================================================

/// A ring of storage systems sharing one failover/selection policy
///
/// Treated as an immutable value by the selector; changes are committed as a
/// whole new group with a bumped version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSystemGroup {
    /// Group identifier
    pub id: String,
    /// Upper bound of the active set
    pub parallelism: usize,
    /// Systems currently receiving round-robin writes
    pub active: Vec<String>,
    /// Ring position from which new candidates are pulled
    pub next_system_id: Option<String>,
    /// All systems of the group in configuration order
    pub systems: IndexMap<String, StorageSystem>,
    /// Commit stamp, bumped on every committed change
    #[serde(default)]
    pub version: u64,
}

impl StorageSystemGroup {
    /// Build a group and check its invariants
    pub fn new(
        id: impl Into<String>,
        parallelism: usize,
        systems: Vec<StorageSystem>,
        active: Vec<String>,
        next_system_id: Option<String>,
    ) -> Result<Self> {
        let group = Self {
            id: id.into(),
            parallelism,
            active,
            next_system_id,
            systems: systems.into_iter().map(|s| (s.id.clone(), s)).collect(),
            version: 0,
        };
        group.validate()?;
        Ok(group)
    }

    /// Look up a system of this group
    pub fn system(&self, id: &str) -> Option<&StorageSystem> {
        self.systems.get(id)
    }

    /// Check whether a system is in the active set
    pub fn is_active(&self, id: &str) -> bool {
        self.active.iter().any(|a| a == id)
    }

    /// Where a ring walk starts: the ring pointer, or the first system
    pub fn ring_start(&self) -> Option<&str> {
        self.next_system_id
            .as_deref()
            .filter(|id| self.systems.contains_key(*id))
            .or_else(|| self.systems.keys().next().map(String::as_str))
    }

    /// Successor of a system in the ring
    pub fn successor(&self, id: &str) -> Option<&str> {
        self.systems.get(id).map(|s| s.next_system_id.as_str())
    }

    /// Validate group invariants
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Configuration(format!(
                "group {}: parallelism must be at least 1",
                self.id
            )));
        }
        if self.systems.is_empty() {
            return Err(Error::Configuration(format!(
                "group {}: no storage systems",
                self.id
            )));
        }
        if self.active.len() > self.parallelism {
            return Err(Error::Configuration(format!(
                "group {}: {} active systems exceed parallelism {}",
                self.id,
                self.active.len(),
                self.parallelism
            )));
        }

        let mut seen = HashSet::new();
        for id in &self.active {
            let system = self.systems.get(id).ok_or_else(|| {
                Error::Configuration(format!("group {}: unknown active system {}", self.id, id))
            })?;
            if !system.is_writable_candidate() {
                return Err(Error::Configuration(format!(
                    "group {}: active system {} is read-only or not installed",
                    self.id, id
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::Configuration(format!(
                    "group {}: system {} is active twice",
                    self.id, id
                )));
            }
        }

        self.validate_ring()
    }

    /// The ring must be one cycle through every system of the group
    fn validate_ring(&self) -> Result<()> {
        let start = match self.systems.keys().next() {
            Some(id) => id.as_str(),
            None => return Ok(()),
        };

        let mut visited = HashSet::new();
        let mut current = start;
        loop {
            if !visited.insert(current) {
                break;
            }
            current = self.successor(current).ok_or_else(|| {
                Error::Configuration(format!(
                    "group {}: ring leaves the group at {}",
                    self.id, current
                ))
            })?;
            if !self.systems.contains_key(current) {
                return Err(Error::Configuration(format!(
                    "group {}: ring points to unknown system {}",
                    self.id, current
                )));
            }
        }

        if current != start || visited.len() != self.systems.len() {
            return Err(Error::Configuration(format!(
                "group {}: ring is not a single cycle over all systems",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn system(id: &str, next: &str) -> StorageSystem {
        StorageSystem {
            id: id.to_string(),
            uri: format!("mem://{}", id),
            read_only: false,
            installed: true,
            status: SystemStatus::Ok,
            min_free_space: SpaceThreshold::Absolute(0),
            next_system_id: next.to_string(),
        }
    }

    pub(crate) fn ring_group(parallelism: usize, active: &[&str]) -> StorageSystemGroup {
        StorageSystemGroup::new(
            "g1",
            parallelism,
            vec![
                system("fs1", "fs2"),
                system("fs2", "fs3"),
                system("fs3", "fs1"),
            ],
            active.iter().map(|s| s.to_string()).collect(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("1K").unwrap(), 1024);
        assert_eq!(parse_capacity("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("100X").is_err());
    }

    #[test]
    fn test_space_threshold() {
        let pct: SpaceThreshold = "10%".parse().unwrap();
        assert_eq!(pct, SpaceThreshold::Percent(10.0));
        assert_eq!(pct.resolve(1000), 100);
        assert!(pct.is_relative());

        let abs: SpaceThreshold = "2Ki".parse().unwrap();
        assert_eq!(abs.resolve(1), 2048);
        assert!("150%".parse::<SpaceThreshold>().is_err());
    }

    #[test]
    fn test_ring_validation() {
        let group = ring_group(2, &["fs1"]);
        assert_eq!(group.ring_start(), Some("fs1"));
        assert_eq!(group.successor("fs3"), Some("fs1"));

        // Two disjoint cycles
        let broken = StorageSystemGroup::new(
            "g1",
            1,
            vec![system("a", "a"), system("b", "b")],
            vec![],
            None,
        );
        assert!(broken.is_err());

        // Successor outside the group
        let dangling = StorageSystemGroup::new("g1", 1, vec![system("a", "zz")], vec![], None);
        assert!(dangling.is_err());
    }

    #[test]
    fn test_active_set_invariants() {
        let too_many = StorageSystemGroup::new(
            "g1",
            1,
            vec![system("a", "b"), system("b", "a")],
            vec!["a".into(), "b".into()],
            None,
        );
        assert!(too_many.is_err());

        let mut ro = system("a", "a");
        ro.read_only = true;
        let read_only_active = StorageSystemGroup::new("g1", 1, vec![ro], vec!["a".into()], None);
        assert!(read_only_active.is_err());
    }
}
