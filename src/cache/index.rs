//! Eviction Index
//!
//! Insertion-ordered map of cached files. The front is always the next
//! eviction victim; under LRU an access moves the file to the back.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Order in which cached files are evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Oldest registration first
    Fifo,
    /// Least recently accessed first
    #[default]
    Lru,
}

/// Cached files in eviction order (front = oldest)
#[derive(Debug)]
pub struct EvictionIndex {
    policy: CachePolicy,
    entries: IndexMap<PathBuf, u64>,
    total_bytes: u64,
}

impl EvictionIndex {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: IndexMap::new(),
            total_bytes: 0,
        }
    }

    /// Track a file; re-registering refreshes its position under LRU only
    pub fn insert(&mut self, path: PathBuf, size_bytes: u64) {
        let old = match self.policy {
            CachePolicy::Lru => self.entries.shift_remove(&path),
            CachePolicy::Fifo => self.entries.get(&path).copied(),
        };
        if let Some(old) = old {
            self.total_bytes = self.total_bytes.saturating_sub(old);
        }
        self.total_bytes += size_bytes;
        self.entries.insert(path, size_bytes);
    }

    /// Record an access, returning whether the file is tracked
    pub fn touch(&mut self, path: &Path) -> bool {
        match self.policy {
            CachePolicy::Fifo => self.entries.contains_key(path),
            CachePolicy::Lru => match self.entries.shift_remove_entry(path) {
                Some((key, size)) => {
                    self.entries.insert(key, size);
                    true
                }
                None => false,
            },
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Stop tracking a file
    pub fn remove(&mut self, path: &Path) -> Option<u64> {
        let size = self.entries.shift_remove(path)?;
        self.total_bytes = self.total_bytes.saturating_sub(size);
        Some(size)
    }

    /// Take the next eviction victim
    pub fn pop_oldest(&mut self) -> Option<(PathBuf, u64)> {
        let (path, size) = self.entries.shift_remove_index(0)?;
        self.total_bytes = self.total_bytes.saturating_sub(size);
        Some((path, size))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of all tracked files
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
