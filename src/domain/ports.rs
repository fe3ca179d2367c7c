//! Domain Ports - Core trait definitions for the archiver
//!
//! These traits define the boundaries between the archival logic and the
//! storage media. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::system::Availability;
use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Uniform blocking operations over one storage medium
///
/// Backends never retry on their own; the archival pipeline owns retries.
pub trait StorageBackend: Send + Sync {
    /// Storage system id this backend serves
    fn system_id(&self) -> &str;

    /// Probe whether the medium currently accepts writes
    fn check_writable(&self) -> Result<()>;

    /// Bytes currently available for new objects
    fn usable_space(&self) -> Result<u64>;

    /// Total capacity of the medium in bytes
    fn total_space(&self) -> Result<u64>;

    /// Open a new object for writing
    ///
    /// Fails with [`Error::ObjectAlreadyExists`] if the name is occupied.
    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>>;

    /// Open an existing object for reading
    ///
    /// Fails with [`Error::ObjectNotFound`] if the object is absent.
    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Delete an object and any parent directories it leaves empty
    fn delete(&self, name: &str) -> Result<()>;

    /// Check whether an object exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Marker extensions probed by [`StorageBackend::query_status`]
    fn status_markers(&self) -> &[(String, Availability)] {
        &[]
    }

    /// Copy a local file into a new object
    fn store(&self, source: &Path, name: &str) -> Result<u64> {
        let mut input = fs::File::open(source)?;
        let mut out = self.open_write(name)?;
        let copied = io::copy(&mut input, &mut out).and_then(|n| out.flush().map(|_| n));
        drop(out);
        match copied {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = self.delete(name);
                Err(e.into())
            }
        }
    }

    /// Move a local file into a new object, removing the source afterwards
    fn move_from(&self, source: &Path, name: &str) -> Result<u64> {
        let copied = self.store(source, name)?;
        fs::remove_file(source)?;
        Ok(copied)
    }

    /// Availability of an object, signalled by sibling marker objects
    fn query_status(&self, name: &str) -> Result<Option<Availability>> {
        for (ext, status) in self.status_markers() {
            if self.exists(&format!("{}{}", name, ext))? {
                return Ok(Some(*status));
            }
        }
        Ok(None)
    }
}

/// Type alias for Arc'd StorageBackend
pub type StorageBackendRef = Arc<dyn StorageBackend>;

/// Helper for backends: wrap an unavailable medium
pub(crate) fn unavailable(system: &str, reason: impl std::fmt::Display) -> Error {
    Error::BackendUnavailable {
        system: system.to_string(),
        reason: reason.to_string(),
    }
}
