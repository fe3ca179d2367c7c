//! Ring Archiver - Failover-Aware Container Archival
//!
//! Bundles batches of entries into ZIP or TAR containers, optionally with a
//! SHA-256 manifest, and stores them on a ring of storage systems. Systems
//! that fill up or go offline are dropped from the active set and replaced by
//! walking the ring; failed attempts are retried through a delayed queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Archiver Pipeline                              │
//! │        submit ─▶ RetryQueue ─▶ attempt (blocking pool) ─▶ ArchiveEvent      │
//! ├──────────────────────┬──────────────────────────┬───────────────────────────┤
//! │   Group Registry     │   Extraction Coordinator │     Container Codecs      │
//! │  (CAS-committed      │   (single-flight passes  │   (ZIP / TAR + manifest)  │
//! │   group snapshots)   │    into the file cache)  │                           │
//! │          │           │            │             │                           │
//! │   System Selector    │       File Cache         │                           │
//! │  (round-robin, ring  │   (FIFO / LRU eviction)  │                           │
//! │   top-up)            │                          │                           │
//! ├──────────────────────┴──────────────────────────┴───────────────────────────┤
//! │                             Storage Backends                                │
//! │        ┌─────────────────────┐           ┌─────────────────────┐            │
//! │        │   Local filesystem  │           │       Memory        │            │
//! │        │     (file://)       │           │       (mem://)      │            │
//! │        └─────────────────────┘           └─────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`]: Storage backend adapters and registry
//! - [`cache`]: Local file cache with eviction
//! - [`codec`]: Container formats and checksum manifests
//! - [`config`]: YAML/JSON configuration
//! - [`domain`]: Core domain types and the backend port
//! - [`error`]: Error types and handling
//! - [`extraction`]: Single-flight entry extraction
//! - [`metrics`]: Prometheus counters
//! - [`pipeline`]: Retrying archival pipeline
//! - [`selector`]: Storage system selection

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod metrics;
pub mod pipeline;
pub mod selector;

// Re-export commonly used types
pub use backend::{BackendFactory, BackendRegistry, LocalBackend, MemoryBackend};

pub use cache::{CachePolicy, FileCache, FileCacheConfig};

pub use codec::{codec_for, ContainerCodec, ContainerCodecRef, ContainerFormat, Manifest};

pub use config::{ArchiveConfig, ArchiverConfig, GroupConfig, StorageSystemConfig};

pub use domain::{
    ArchiveEntry, Availability, EntrySource, SpaceThreshold, StorageBackend, StorageBackendRef,
    StorageSystem, StorageSystemGroup, SystemStatus,
};

pub use error::{Error, ErrorAction, Result};

pub use extraction::{ExtractionCoordinator, ExtractionPolicy};

pub use metrics::ArchiverMetrics;

pub use pipeline::{
    ArchiveEvent, ArchiveState, Archiver, ArchiverContext, GroupPolicy, LocalRetryQueue,
    RetryHandler, RetryMessage, RetryQueue,
};

pub use selector::{GroupRegistry, StorageSystemSelector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
