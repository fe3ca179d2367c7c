//! Storage Backend Adapters
//!
//! Provides adapters for the storage media a group can write to:
//! - Local: filesystem directories, including mounted CIFS/NFS shares
//! - Memory: in-process object store
//!
//! Network protocols (SFTP, S3, Swift) are capability providers that plug in
//! through the same [`StorageBackend`](crate::domain::StorageBackend) port; their schemes are recognized but
//! not served by this crate.

pub mod local;
pub mod memory;
pub mod traced;

pub use local::{fs_stats, FsStats, LocalBackend};
pub use memory::MemoryBackend;
pub use traced::TracedBackend;

use crate::config::StorageSystemConfig;
use crate::domain::ports::StorageBackendRef;
use crate::domain::system::parse_capacity;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Capacity of `mem://` backends without an explicit `capacity` parameter
pub const DEFAULT_MEMORY_CAPACITY: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Backend Factory
// =============================================================================

/// Factory for creating storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend for a storage system, wrapped in the requested decorators
    pub fn create(config: &StorageSystemConfig, traced: bool) -> Result<StorageBackendRef> {
        let markers: Vec<_> = config
            .status_markers
            .iter()
            .map(|(ext, status)| (ext.clone(), *status))
            .collect();

        let (scheme, rest) = config.uri.split_once("://").ok_or_else(|| {
            Error::Configuration(format!(
                "storage system {}: URI {} has no scheme",
                config.id, config.uri
            ))
        })?;

        let base: StorageBackendRef = match scheme.to_lowercase().as_str() {
            "file" => Arc::new(LocalBackend::new(&config.id, rest)?.with_status_markers(markers)),
            "mem" => {
                let capacity = memory_capacity(rest)?;
                Arc::new(MemoryBackend::new(&config.id, capacity).with_status_markers(markers))
            }
            other => {
                return Err(Error::UnsupportedBackend {
                    scheme: other.to_string(),
                })
            }
        };

        info!(system = %config.id, uri = %config.uri, traced, "Created storage backend");

        if traced {
            Ok(Arc::new(TracedBackend::new(base)))
        } else {
            Ok(base)
        }
    }
}

/// Parse the `capacity` query parameter of a `mem://` URI
fn memory_capacity(rest: &str) -> Result<u64> {
    let query = match rest.split_once('?') {
        Some((_, query)) => query,
        None => return Ok(DEFAULT_MEMORY_CAPACITY),
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "capacity")
        .map(|(_, value)| parse_capacity(value))
        .unwrap_or(Ok(DEFAULT_MEMORY_CAPACITY))
}

// =============================================================================
// Backend Registry
// =============================================================================

/// Backends keyed by storage system id
#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, StorageBackendRef>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its system id, replacing any previous one
    pub fn insert(&self, backend: StorageBackendRef) {
        self.backends
            .insert(backend.system_id().to_string(), backend);
    }

    /// Look up the backend of a storage system
    pub fn get(&self, system_id: &str) -> Result<StorageBackendRef> {
        self.backends
            .get(system_id)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::UnknownSystem {
                system: system_id.to_string(),
            })
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
