//! Archive Entry Types
//!
//! Entries are the named units of data bundled into one container.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Where the bytes of an entry come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EntrySource {
    /// A file already materialized on local disk
    Path { path: PathBuf },
    /// An entry of a container stored on another storage system
    Container {
        system_id: String,
        container: String,
        entry: String,
    },
}

/// One named, digest-tagged unit of data within a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Name of the entry inside the container
    pub name: String,
    /// Source of the entry bytes
    pub source: EntrySource,
    /// Lower-case hex SHA-256 digest, computed on demand when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ArchiveEntry {
    /// Create an entry backed by a local file
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::Path { path: path.into() },
            digest: None,
        }
    }

    /// Create an entry that must be pulled out of another container first
    pub fn from_container(
        name: impl Into<String>,
        system_id: impl Into<String>,
        container: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::Container {
                system_id: system_id.into(),
                container: container.into(),
                entry: entry.into(),
            },
            digest: None,
        }
    }

    /// Attach a known digest
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Local path of the entry, once materialized
    pub fn local_path(&self) -> Option<&PathBuf> {
        match &self.source {
            EntrySource::Path { path } => Some(path),
            EntrySource::Container { .. } => None,
        }
    }

    /// Local path of the entry, failing for unresolved container sources
    pub fn require_local_path(&self) -> Result<&PathBuf> {
        self.local_path().ok_or_else(|| {
            Error::Internal(format!("entry {} has not been materialized", self.name))
        })
    }
}

/// Validate entry names of one container
///
/// Names must be unique, relative, and must not collide with the manifest.
pub fn validate_entries(
    container: &str,
    entries: &[ArchiveEntry],
    manifest: Option<&str>,
) -> Result<()> {
    let mut names = HashSet::new();
    for entry in entries {
        validate_name(&entry.name)?;
        if Some(entry.name.as_str()) == manifest || !names.insert(entry.name.as_str()) {
            return Err(Error::DuplicateEntry {
                entry: entry.name.clone(),
                container: container.to_string(),
            });
        }
    }
    Ok(())
}

/// Reject names that could escape a root directory
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains('\0')
        || name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
