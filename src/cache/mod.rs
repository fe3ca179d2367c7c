//! Local File Cache
//!
//! Staging area for entries extracted from containers. Files live under
//! `root/<system>/<container>/<entry>` and are tracked in an eviction index.
//! When free space on the cache filesystem drops below the configured
//! threshold, an eviction pass runs in the background and deletes the oldest
//! files (FIFO) or least recently accessed files (LRU) until space recovers.
//!
//! # Example
//!
//! ```rust,ignore
//! use ring_archiver::cache::{FileCache, FileCacheConfig};
//!
//! let cache = FileCache::open(config, metrics)?;
//! let path = cache.to_path("fs1", "2024/c.zip", Some("alpha"))?;
//! // ... materialize the file ...
//! cache.register(&path)?;
//! assert!(cache.access(&path));
//! ```

pub mod index;
pub mod probe;

pub use index::{CachePolicy, EvictionIndex};
pub use probe::{QuotaProbe, SpaceProbe, StatvfsProbe};

use crate::domain::system::SpaceThreshold;
use crate::domain::validate_name;
use crate::error::{Error, Result};
use crate::metrics::ArchiverMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Suffix of files still being materialized
pub const PART_SUFFIX: &str = ".part";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the file cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    /// Root directory of the cache
    pub root: PathBuf,
    /// Eviction order
    #[serde(default)]
    pub policy: CachePolicy,
    /// Free space to keep on the cache filesystem
    #[serde(default)]
    pub min_free_space: SpaceThreshold,
}

// =============================================================================
// File Cache
// =============================================================================

struct CacheInner {
    config: FileCacheConfig,
    index: Mutex<EvictionIndex>,
    /// Serializes eviction passes
    eviction: Mutex<()>,
    /// Set while a background pass is scheduled or running
    scheduled: AtomicBool,
    probe: Arc<dyn SpaceProbe>,
    metrics: ArchiverMetrics,
}

/// Local staging cache with FIFO/LRU eviction
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

impl FileCache {
    /// Create an empty cache, probing free space with `statvfs`
    pub fn new(config: FileCacheConfig, metrics: ArchiverMetrics) -> Result<Self> {
        Self::with_probe(config, Arc::new(StatvfsProbe), metrics)
    }

    /// Create an empty cache with a custom space probe
    pub fn with_probe(
        config: FileCacheConfig,
        probe: Arc<dyn SpaceProbe>,
        metrics: ArchiverMetrics,
    ) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                index: Mutex::new(EvictionIndex::new(config.policy)),
                config,
                eviction: Mutex::new(()),
                scheduled: AtomicBool::new(false),
                probe,
                metrics,
            }),
        })
    }

    /// Create a cache and index the files already under its root
    pub fn open(config: FileCacheConfig, metrics: ArchiverMetrics) -> Result<Self> {
        let cache = Self::new(config, metrics)?;
        cache.rebuild()?;
        Ok(cache)
    }

    /// Re-index files under the root in modification-time order
    ///
    /// Leftover `*.part` files of interrupted extractions are deleted.
    pub fn rebuild(&self) -> Result<usize> {
        let mut found = Vec::new();
        collect_files(&self.inner.config.root, &mut found)?;
        found.sort_by_key(|(_, mtime, _)| *mtime);

        let mut index = self.inner.index.lock();
        let mut count = 0;
        for (path, _, size) in found {
            index.insert(path, size);
            count += 1;
        }
        info!(root = %self.root().display(), files = count, "Cache index rebuilt");
        Ok(count)
    }

    /// Root directory of the cache
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Deterministic cache location of a container or one of its entries
    pub fn to_path(&self, system_id: &str, name: &str, entry: Option<&str>) -> Result<PathBuf> {
        if system_id.contains('/') {
            return Err(Error::InvalidName {
                name: system_id.to_string(),
            });
        }
        validate_name(system_id)?;
        validate_name(name)?;

        let mut path = self.root().join(system_id).join(name);
        if let Some(entry) = entry {
            validate_name(entry)?;
            path.push(entry);
        }
        Ok(path)
    }

    /// Track a materialized file, scheduling eviction when space runs low
    pub fn register(&self, path: &Path) -> Result<()> {
        let size = fs::metadata(path)?.len();
        self.inner.index.lock().insert(path.to_path_buf(), size);
        debug!(path = %path.display(), size, "Registered cache file");

        match self.needs_eviction() {
            Ok(true) => self.schedule_eviction(),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Cannot probe cache free space"),
        }
        Ok(())
    }

    /// Record an access, returning whether the file is cached
    pub fn access(&self, path: &Path) -> bool {
        self.inner.index.lock().touch(path)
    }

    /// Stop tracking a file that vanished from disk
    pub fn forget(&self, path: &Path) {
        if let Some(size) = self.inner.index.lock().remove(path) {
            debug!(path = %path.display(), size, "Dropped stale cache file");
        }
    }

    /// Whether a file is cached, without counting as an access
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.index.lock().contains(path)
    }

    /// Number of cached files
    pub fn len(&self) -> usize {
        self.inner.index.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.index.lock().is_empty()
    }

    /// Bytes of all cached files
    pub fn total_bytes(&self) -> u64 {
        self.inner.index.lock().total_bytes()
    }

    /// Whether free space is below the configured threshold
    pub fn needs_eviction(&self) -> Result<bool> {
        let stats = self.inner.probe.stats(self.root())?;
        let threshold = self.inner.config.min_free_space.resolve(stats.total_bytes);
        Ok(stats.available_bytes < threshold)
    }

    /// Evict files until free space recovers or the cache is empty
    ///
    /// Victims are picked under the index lock; files are deleted after it is
    /// released. Returns the number of files evicted.
    pub fn evict_now(&self) -> Result<usize> {
        let _pass = self.inner.eviction.lock();
        let mut evicted = 0;

        while self.needs_eviction()? {
            let victim = self.inner.index.lock().pop_oldest();
            let (path, size) = match victim {
                Some(v) => v,
                None => {
                    warn!(
                        root = %self.root().display(),
                        "Cache is empty but free space is still below threshold"
                    );
                    break;
                }
            };

            match fs::remove_file(&path) {
                Ok(()) => {
                    evicted += 1;
                    self.inner.metrics.cache_evictions.inc();
                    debug!(path = %path.display(), size, "Evicted cache file");
                    self.prune_empty_parents(path.parent());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to evict cache file"),
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.len(), "Cache eviction pass finished");
        }
        Ok(evicted)
    }

    /// Run an eviction pass in the background unless one is already pending
    fn schedule_eviction(&self) {
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let cache = self.clone();
        let job = move || {
            if let Err(e) = cache.evict_now() {
                warn!(error = %e, "Cache eviction failed");
            }
            cache.inner.scheduled.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("cache-evict".into())
                    .spawn(job);
                if let Err(e) = spawned {
                    warn!(error = %e, "Cannot start cache eviction thread");
                    self.inner.scheduled.store(false, Ordering::Release);
                }
            }
        }
    }

    fn prune_empty_parents(&self, mut dir: Option<&Path>) {
        let root = self.root();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

/// Collect `(path, mtime, size)` of regular files, deleting `*.part` leftovers
fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime, u64)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            if path.to_string_lossy().ends_with(PART_SUFFIX) {
                debug!(path = %path.display(), "Removing partial cache file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Cannot remove partial cache file");
                }
                continue;
            }
            let meta = entry.metadata()?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((path, mtime, meta.len()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(tmp: &TempDir, policy: CachePolicy, capacity: u64, min_free: u64) -> FileCache {
        let config = FileCacheConfig {
            root: tmp.path().join("cache"),
            policy,
            min_free_space: SpaceThreshold::Absolute(min_free),
        };
        FileCache::with_probe(
            config,
            Arc::new(QuotaProbe::new(capacity)),
            ArchiverMetrics::new().unwrap(),
        )
        .unwrap()
    }

    fn put(cache: &FileCache, name: &str, size: usize) -> PathBuf {
        let path = cache.to_path("fs1", "c.zip", Some(name)).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_to_path_rejects_escapes() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp, CachePolicy::Lru, 1000, 0);

        let path = cache.to_path("fs1", "2024/c.zip", Some("dir/alpha")).unwrap();
        assert_eq!(path, cache.root().join("fs1/2024/c.zip/dir/alpha"));
        assert_eq!(
            cache.to_path("fs1", "c.zip", None).unwrap(),
            cache.root().join("fs1/c.zip")
        );

        assert_matches!(cache.to_path("fs1", "../x", None), Err(Error::InvalidName { .. }));
        assert_matches!(cache.to_path("fs1", "/etc/passwd", None), Err(Error::InvalidName { .. }));
        assert_matches!(cache.to_path("fs1", "a//b", None), Err(Error::InvalidName { .. }));
        assert_matches!(cache.to_path("a/b", "c", None), Err(Error::InvalidName { .. }));
        assert_matches!(
            cache.to_path("fs1", "c.zip", Some("../../x")),
            Err(Error::InvalidName { .. })
        );
    }

    #[test]
    fn test_lru_eviction_order() {
        let tmp = TempDir::new().unwrap();
        // 300 byte quota, keep 150 free
        let cache = cache(&tmp, CachePolicy::Lru, 300, 150);

        let a = put(&cache, "a", 50);
        let b = put(&cache, "b", 50);
        cache.inner.index.lock().insert(a.clone(), 50);
        cache.inner.index.lock().insert(b.clone(), 50);
        assert!(cache.access(&a));

        let c = put(&cache, "c", 100);
        cache.inner.index.lock().insert(c.clone(), 100);

        // 200 used, 100 free: evicting b (least recent) frees enough
        assert_eq!(cache.evict_now().unwrap(), 1);
        assert!(!b.exists());
        assert!(a.exists() && c.exists());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fifo_eviction_order() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp, CachePolicy::Fifo, 300, 150);

        let a = put(&cache, "a", 50);
        let b = put(&cache, "b", 50);
        let c = put(&cache, "c", 100);
        for (p, s) in [(&a, 50), (&b, 50), (&c, 100)] {
            cache.inner.index.lock().insert(p.clone(), s);
        }
        assert!(cache.access(&a));

        assert_eq!(cache.evict_now().unwrap(), 1);
        assert!(!a.exists());
        assert!(b.exists());
    }

    #[test]
    fn test_evict_prunes_empty_directories() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp, CachePolicy::Lru, 100, 100);
        let a = put(&cache, "deep/a", 10);
        cache.inner.index.lock().insert(a.clone(), 10);

        assert_eq!(cache.evict_now().unwrap(), 1);
        assert!(!cache.root().join("fs1").exists());
        assert!(cache.root().exists());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_register_schedules_background_eviction() {
        let tmp = TempDir::new().unwrap();
        let cache = cache(&tmp, CachePolicy::Fifo, 100, 60);

        let a = put(&cache, "a", 30);
        cache.register(&a).unwrap();
        assert!(a.exists());

        let b = put(&cache, "b", 30);
        cache.register(&b).unwrap();

        // Background pass deletes the oldest file
        let mut waited = 0;
        while a.exists() && waited < 100 {
            std::thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(cache.inner.metrics.cache_evictions.get(), 1);
    }

    #[test]
    fn test_open_rebuilds_index_and_drops_parts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        fs::create_dir_all(root.join("fs1/c.zip")).unwrap();
        fs::write(root.join("fs1/c.zip/old"), b"1").unwrap();
        fs::write(root.join("fs1/c.zip/new.part"), b"2").unwrap();

        let config = FileCacheConfig {
            root: root.clone(),
            policy: CachePolicy::Lru,
            min_free_space: SpaceThreshold::Absolute(0),
        };
        let cache = FileCache::open(config, ArchiverMetrics::new().unwrap()).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&root.join("fs1/c.zip/old")));
        assert!(!root.join("fs1/c.zip/new.part").exists());
    }
}
