//! Tracing Decorator
//!
//! Wraps any backend and logs each operation with its duration and outcome.

use crate::domain::ports::{StorageBackend, StorageBackendRef};
use crate::domain::system::Availability;
use crate::error::Result;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

/// Backend decorator emitting one tracing event per operation
pub struct TracedBackend {
    inner: StorageBackendRef,
}

impl TracedBackend {
    /// Wrap a backend
    pub fn new(inner: StorageBackendRef) -> Self {
        Self { inner }
    }

    fn observe<T>(&self, op: &'static str, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => debug!(
                system = %self.inner.system_id(),
                op,
                name,
                elapsed_ms,
                "Backend operation completed"
            ),
            Err(e) => warn!(
                system = %self.inner.system_id(),
                op,
                name,
                elapsed_ms,
                error = %e,
                "Backend operation failed"
            ),
        }
        result
    }
}

impl StorageBackend for TracedBackend {
    fn system_id(&self) -> &str {
        self.inner.system_id()
    }

    fn check_writable(&self) -> Result<()> {
        self.observe("check_writable", "", || self.inner.check_writable())
    }

    fn usable_space(&self) -> Result<u64> {
        self.observe("usable_space", "", || self.inner.usable_space())
    }

    fn total_space(&self) -> Result<u64> {
        self.observe("total_space", "", || self.inner.total_space())
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>> {
        self.observe("open_write", name, || self.inner.open_write(name))
    }

    fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        self.observe("open_read", name, || self.inner.open_read(name))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.observe("delete", name, || self.inner.delete(name))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn status_markers(&self) -> &[(String, Availability)] {
        self.inner.status_markers()
    }

    fn store(&self, source: &Path, name: &str) -> Result<u64> {
        self.observe("store", name, || self.inner.store(source, name))
    }

    fn move_from(&self, source: &Path, name: &str) -> Result<u64> {
        self.observe("move", name, || self.inner.move_from(source, name))
    }

    fn query_status(&self, name: &str) -> Result<Option<Availability>> {
        self.observe("query_status", name, || self.inner.query_status(name))
    }
}
