//! Local Filesystem Backend
//!
//! Stores objects as files under a root directory. Mounted network shares
//! (CIFS, NFS) are served by the same adapter.

use crate::domain::ports::{unavailable, StorageBackend};
use crate::domain::system::Availability;
use crate::domain::validate_name;
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// Filesystem Statistics
// =============================================================================

/// Space figures of the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Bytes available to unprivileged writers
    pub available_bytes: u64,
    /// Total size of the filesystem
    pub total_bytes: u64,
}

/// Query space figures of the filesystem holding `path`
pub fn fs_stats(path: &Path) -> io::Result<FsStats> {
    let stats = fs4::statvfs(path)?;
    Ok(FsStats {
        available_bytes: stats.available_space(),
        total_bytes: stats.total_space(),
    })
}

// =============================================================================
// Local Backend
// =============================================================================

/// Backend storing objects as files below a root directory
pub struct LocalBackend {
    system_id: String,
    root: PathBuf,
    status_markers: Vec<(String, Availability)>,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed
    pub fn new(system_id: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            system_id: system_id.into(),
            root,
            status_markers: Vec::new(),
        })
    }

    /// Set the marker extensions used to query object status
    pub fn with_status_markers(mut self, markers: Vec<(String, Availability)>) -> Self {
        self.status_markers = markers;
        self
    }

    /// Root directory of this backend
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object name below the root
    fn object_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn map_io(&self, name: &str, err: io::Error) -> Error {
        Error::from_io(&self.system_id, name, err)
    }

    /// Remove empty directories from `dir` upwards, stopping below the root
    fn prune_empty_parents(&self, mut dir: Option<&Path>) {
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            match fs::remove_dir(current) {
                Ok(()) => debug!(dir = %current.display(), "Removed empty directory"),
                // Already removed by a concurrent delete
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                // Not empty, or a concurrent writer just created a sibling
                Err(_) => break,
            }
            dir = current.parent();
        }
    }
}

impl StorageBackend for LocalBackend {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn check_writable(&self) -> Result<()> {
        let meta = fs::metadata(&self.root).map_err(|e| unavailable(&self.system_id, e))?;
        if !meta.is_dir() {
            return Err(unavailable(&self.system_id, "root is not a directory"));
        }

        let probe = tempfile::Builder::new()
            .prefix(".writable-")
            .tempfile_in(&self.root)
            .map_err(|e| unavailable(&self.system_id, e))?;
        drop(probe);
        Ok(())
    }

    fn usable_space(&self) -> Result<u64> {
        fs_stats(&self.root)
            .map(|s| s.available_bytes)
            .map_err(|e| unavailable(&self.system_id, e))
    }

    fn total_space(&self) -> Result<u64> {
        fs_stats(&self.root)
            .map(|s| s.total_bytes)
            .map_err(|e| unavailable(&self.system_id, e))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        let path = self.object_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| self.map_io(name, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(name)?;
        let file = fs::File::open(&path).map_err(|e| self.map_io(name, e))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        fs::remove_file(&path).map_err(|e| self.map_io(name, e))?;
        self.prune_empty_parents(path.parent());
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name)?.is_file())
    }

    fn status_markers(&self) -> &[(String, Availability)] {
        &self.status_markers
    }

    fn move_from(&self, source: &Path, name: &str) -> Result<u64> {
        let path = self.object_path(name)?;
        if path.exists() {
            return Err(Error::ObjectAlreadyExists {
                system: self.system_id.clone(),
                name: name.to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let size = fs::metadata(source)?.len();
        match fs::rename(source, &path) {
            Ok(()) => Ok(size),
            Err(e) => {
                // Different filesystem: copy, then drop the source
                warn!(
                    system = %self.system_id,
                    error = %e,
                    "Rename failed, falling back to copy"
                );
                let copied = self.store(source, name)?;
                fs::remove_file(source)?;
                Ok(copied)
            }
        }
    }
}
