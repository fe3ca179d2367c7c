//! Archiver Context
//!
//! The unit of work of the archival pipeline. Contexts are serializable so a
//! durable retry queue can carry them between attempts.

use crate::domain::ArchiveEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One container to be built from a batch of entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverContext {
    /// Storage system group receiving the container
    pub group_id: String,
    /// Object name of the container on the selected system
    pub container: String,
    /// Entries in write order
    pub entries: Vec<ArchiveEntry>,
    /// System the container was stored on, set after success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    /// Caller-defined side channel, passed through untouched
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Attempts already re-scheduled
    #[serde(default)]
    pub retries: u32,
}

impl ArchiverContext {
    pub fn new(
        group_id: impl Into<String>,
        container: impl Into<String>,
        entries: Vec<ArchiveEntry>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            container: container.into(),
            entries,
            system_id: None,
            properties: BTreeMap::new(),
            retries: 0,
        }
    }

    /// Attach a side-channel property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Names of all entries in write order
    pub fn entry_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }
}

/// Stage of an archival attempt, as reported in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Building,
    Selecting,
    Writing,
    Verifying,
    Done,
    RetryScheduled,
    FailedTerminal,
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveState::Building => "building",
            ArchiveState::Selecting => "selecting",
            ArchiveState::Writing => "writing",
            ArchiveState::Verifying => "verifying",
            ArchiveState::Done => "done",
            ArchiveState::RetryScheduled => "retry_scheduled",
            ArchiveState::FailedTerminal => "failed_terminal",
        };
        f.write_str(s)
    }
}
