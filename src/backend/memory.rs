//! In-Memory Object Backend
//!
//! Object-store style backend holding every object in a DashMap. Capacity and
//! writability can be adjusted at runtime, which makes it a stand-in for
//! remote media whose free space and reachability change underneath us.

use crate::domain::ports::{unavailable, StorageBackend};
use crate::domain::system::Availability;
use crate::domain::validate_name;
use crate::error::{Error, Result};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
struct MemoryState {
    objects: DashMap<String, Bytes>,
    capacity_bytes: AtomicU64,
    used_bytes: AtomicU64,
    writable: AtomicBool,
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-process object store
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    system_id: String,
    state: Arc<MemoryState>,
    status_markers: Vec<(String, Availability)>,
}

impl MemoryBackend {
    /// Create an empty backend with the given capacity
    pub fn new(system_id: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            system_id: system_id.into(),
            state: Arc::new(MemoryState {
                objects: DashMap::new(),
                capacity_bytes: AtomicU64::new(capacity_bytes),
                used_bytes: AtomicU64::new(0),
                writable: AtomicBool::new(true),
            }),
            status_markers: Vec::new(),
        }
    }

    /// Set the marker extensions used to query object status
    pub fn with_status_markers(mut self, markers: Vec<(String, Availability)>) -> Self {
        self.status_markers = markers;
        self
    }

    /// Change the capacity of the medium
    pub fn set_capacity(&self, capacity_bytes: u64) {
        self.state
            .capacity_bytes
            .store(capacity_bytes, Ordering::Relaxed);
    }

    /// Make the medium reachable or unreachable
    pub fn set_writable(&self, writable: bool) {
        self.state.writable.store(writable, Ordering::Relaxed);
    }

    /// Raw bytes of a stored object
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.state.objects.get(name).map(|b| b.value().clone())
    }

    /// Replace the bytes of a stored object
    pub fn overwrite(&self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        match self.state.objects.get_mut(name) {
            Some(mut slot) => {
                self.state
                    .used_bytes
                    .fetch_sub(slot.len() as u64, Ordering::Relaxed);
                self.state
                    .used_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                *slot = data;
                Ok(())
            }
            None => Err(self.not_found(name)),
        }
    }

    fn not_found(&self, name: &str) -> Error {
        Error::ObjectNotFound {
            system: self.system_id.clone(),
            name: name.to_string(),
        }
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.state.writable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(unavailable(&self.system_id, "medium is offline"))
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn check_writable(&self) -> Result<()> {
        self.ensure_reachable()
    }

    fn usable_space(&self) -> Result<u64> {
        let capacity = self.state.capacity_bytes.load(Ordering::Relaxed);
        let used = self.state.used_bytes.load(Ordering::Relaxed);
        Ok(capacity.saturating_sub(used))
    }

    fn total_space(&self) -> Result<u64> {
        Ok(self.state.capacity_bytes.load(Ordering::Relaxed))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        validate_name(name)?;
        self.ensure_reachable()?;
        match self.state.objects.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::ObjectAlreadyExists {
                system: self.system_id.clone(),
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                // Reserve the name until the writer commits
                slot.insert(Bytes::new());
                Ok(Box::new(MemoryWriter {
                    name: name.to_string(),
                    buffer: Vec::new(),
                    published: 0,
                    state: self.state.clone(),
                }))
            }
        }
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.get(name).ok_or_else(|| self.not_found(name))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.state.objects.remove(name) {
            Some((_, data)) => {
                self.state
                    .used_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            None => Err(self.not_found(name)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.objects.contains_key(name))
    }

    fn status_markers(&self) -> &[(String, Availability)] {
        &self.status_markers
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Buffers an object and publishes it on flush and drop
struct MemoryWriter {
    name: String,
    buffer: Vec<u8>,
    /// Bytes already counted in `used_bytes` by an earlier publish
    published: usize,
    state: Arc<MemoryState>,
}

impl MemoryWriter {
    fn publish(&mut self) {
        if let Some(mut slot) = self.state.objects.get_mut(&self.name) {
            let old = slot.len() as u64;
            *slot = Bytes::copy_from_slice(&self.buffer);
            self.state.used_bytes.fetch_sub(old, Ordering::Relaxed);
            self.state
                .used_bytes
                .fetch_add(self.buffer.len() as u64, Ordering::Relaxed);
            self.published = self.buffer.len();
        }
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.state.writable.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "medium went offline"));
        }
        let capacity = self.state.capacity_bytes.load(Ordering::Relaxed);
        let used = self.state.used_bytes.load(Ordering::Relaxed);
        let others = used.saturating_sub(self.published as u64);
        if others + (self.buffer.len() + buf.len()) as u64 > capacity {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on medium"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_basic_operations() {
        let backend = MemoryBackend::new("mem1", 1024);
        {
            let mut out = backend.open_write("a/obj").unwrap();
            out.write_all(b"hello world").unwrap();
        }
        assert_eq!(backend.get("a/obj").unwrap().as_ref(), b"hello world");
        assert_eq!(backend.usable_space().unwrap(), 1024 - 11);

        let mut data = String::new();
        backend
            .open_read("a/obj")
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "hello world");

        backend.delete("a/obj").unwrap();
        assert_eq!(backend.usable_space().unwrap(), 1024);
        assert_matches!(backend.delete("a/obj"), Err(Error::ObjectNotFound { .. }));
    }

    #[test]
    fn test_name_reserved_while_writing() {
        let backend = MemoryBackend::new("mem1", 1024);
        let _out = backend.open_write("obj").unwrap();
        assert_matches!(
            backend.open_write("obj").map(|_| ()),
            Err(Error::ObjectAlreadyExists { .. })
        );
    }

    #[test]
    fn test_capacity_and_writability() {
        let backend = MemoryBackend::new("mem1", 4);
        let mut out = backend.open_write("obj").unwrap();
        assert!(out.write_all(b"too large").is_err());
        drop(out);

        backend.set_writable(false);
        assert_matches!(
            backend.check_writable(),
            Err(Error::BackendUnavailable { .. })
        );
        assert!(backend.open_write("other").is_err());
    }

    #[test]
    fn test_flushed_bytes_counted_once() {
        let backend = MemoryBackend::new("mem1", 8);
        let mut out = backend.open_write("obj").unwrap();
        out.write_all(b"abcd").unwrap();
        out.flush().unwrap();
        assert_eq!(backend.usable_space().unwrap(), 4);

        // The flushed half must not be charged again
        out.write_all(b"efgh").unwrap();
        assert!(out.write_all(b"i").is_err());
        drop(out);
        assert_eq!(backend.get("obj").unwrap().as_ref(), b"abcdefgh");
        assert_eq!(backend.usable_space().unwrap(), 0);
    }
}
