//! Archiver Configuration
//!
//! Loaded from YAML or JSON, chosen by file extension.
//!
//! ```yaml
//! cache:
//!   root: /var/cache/archiver
//!   policy: lru
//!   min_free_space: 10%
//! groups:
//!   - id: nearline
//!     parallelism: 2
//!     format: zip
//!     manifest: MANIFEST.sha256
//!     max_retries: 3
//!     systems:
//!       - { id: fs1, uri: "file:///mnt/fs1", min_free_space: 5Gi }
//!       - { id: fs2, uri: "file:///mnt/fs2" }
//! ```

use crate::cache::FileCacheConfig;
use crate::codec::ContainerFormat;
use crate::domain::system::{
    Availability, SpaceThreshold, StorageSystem, StorageSystemGroup, SystemStatus,
};
use crate::error::{Error, Result};
use crate::extraction::ExtractionPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Complete archiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Local staging cache
    pub cache: FileCacheConfig,
    /// Pipeline-wide settings
    #[serde(default)]
    pub archiver: ArchiverConfig,
    /// Storage system groups
    pub groups: Vec<GroupConfig>,
}

impl ArchiveConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ArchiveConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported configuration format: {}",
                    other.unwrap_or("<none>")
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: ArchiveConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-group invariants and build every group once
    pub fn validate(&self) -> Result<()> {
        let mut group_ids = HashSet::new();
        let mut system_ids = HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate group id {}",
                    group.id
                )));
            }
            for system in &group.systems {
                if !system_ids.insert(system.id.as_str()) {
                    return Err(Error::Configuration(format!(
                        "storage system {} appears more than once",
                        system.id
                    )));
                }
            }
            group.to_group()?;
        }
        Ok(())
    }

    /// Look up a group by id
    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }
}

// =============================================================================
// Archiver Settings
// =============================================================================

/// Pipeline-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Capacity of the archive event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Compare-and-swap attempts before a group commit gives up
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: usize,
    /// Which extracted entries are materialized into the cache
    #[serde(default)]
    pub extraction_policy: ExtractionPolicy,
    /// Wrap every backend in the tracing decorator
    #[serde(default)]
    pub trace_backends: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            commit_attempts: default_commit_attempts(),
            extraction_policy: ExtractionPolicy::default(),
            trace_backends: false,
        }
    }
}

fn default_event_capacity() -> usize {
    1024
}

fn default_commit_attempts() -> usize {
    8
}

// =============================================================================
// Group Configuration
// =============================================================================

/// One storage system group and its archival policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    /// Upper bound of concurrently active systems
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub format: ContainerFormat,
    /// Name of the checksum manifest entry; no manifest when unset
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Read containers back and check digests after writing
    #[serde(default)]
    pub verify: bool,
    /// Initially active systems; filled by ring top-up when empty
    #[serde(default)]
    pub active: Vec<String>,
    pub systems: Vec<StorageSystemConfig>,
}

fn default_parallelism() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    60_000
}

impl GroupConfig {
    /// Delay between archival attempts
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Build the runtime group, linking systems without `next` in list order
    pub fn to_group(&self) -> Result<StorageSystemGroup> {
        let count = self.systems.len();
        let systems = self
            .systems
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let next = s
                    .next
                    .clone()
                    .unwrap_or_else(|| self.systems[(i + 1) % count].id.clone());
                StorageSystem {
                    id: s.id.clone(),
                    uri: s.uri.clone(),
                    read_only: s.read_only,
                    installed: s.installed,
                    status: SystemStatus::Ok,
                    min_free_space: s.min_free_space,
                    next_system_id: next,
                }
            })
            .collect();

        StorageSystemGroup::new(
            self.id.clone(),
            self.parallelism,
            systems,
            self.active.clone(),
            None,
        )
    }
}

// =============================================================================
// Storage System Configuration
// =============================================================================

/// One storage medium of a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSystemConfig {
    pub id: String,
    /// `file:///path` or `mem://name?capacity=1Gi`
    pub uri: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_installed")]
    pub installed: bool,
    /// `"10%"` or `"5Gi"`
    #[serde(default)]
    pub min_free_space: SpaceThreshold,
    /// Ring successor; defaults to the next system in list order
    #[serde(default)]
    pub next: Option<String>,
    /// Marker extension to availability
    #[serde(default)]
    pub status_markers: IndexMap<String, Availability>,
}

fn default_installed() -> bool {
    true
}
