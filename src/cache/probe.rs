//! Free Space Probes

use crate::backend::{fs_stats, FsStats};
use std::io;
use std::path::Path;

/// Source of free-space figures for the cache filesystem
pub trait SpaceProbe: Send + Sync {
    fn stats(&self, path: &Path) -> io::Result<FsStats>;
}

/// Probe backed by `statvfs`
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn stats(&self, path: &Path) -> io::Result<FsStats> {
        fs_stats(path)
    }
}

/// Probe reporting a fixed capacity minus the bytes stored under the path
///
/// Lets tests drive eviction deterministically on any filesystem.
#[derive(Debug, Clone, Copy)]
pub struct QuotaProbe {
    pub capacity_bytes: u64,
}

impl QuotaProbe {
    pub fn new(capacity_bytes: u64) -> Self {
        Self { capacity_bytes }
    }
}

impl SpaceProbe for QuotaProbe {
    fn stats(&self, path: &Path) -> io::Result<FsStats> {
        let used = dir_size(path)?;
        Ok(FsStats {
            available_bytes: self.capacity_bytes.saturating_sub(used),
            total_bytes: self.capacity_bytes,
        })
    }
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
