//! Archiver Metrics
//!
//! Prometheus counters shared by every component. Counters are created
//! unregistered; call [`ArchiverMetrics::register`] to expose them.

use crate::error::Result;
use prometheus::{IntCounter, Registry};

/// Counters of archival, selection, extraction and cache activity
#[derive(Clone)]
pub struct ArchiverMetrics {
    /// Containers stored successfully
    pub stored: IntCounter,
    /// Archival attempts re-scheduled after a failure
    pub retries: IntCounter,
    /// Contexts dropped after exhausting or skipping retries
    pub terminal_failures: IntCounter,
    /// Storage systems removed from an active set
    pub deactivations: IntCounter,
    /// Full passes over a container by the extraction coordinator
    pub extraction_passes: IntCounter,
    /// Files evicted from the local cache
    pub cache_evictions: IntCounter,
}

impl ArchiverMetrics {
    /// Create a fresh, unregistered set of counters
    pub fn new() -> Result<Self> {
        Ok(Self {
            stored: IntCounter::new("archiver_stored_total", "Containers stored successfully")?,
            retries: IntCounter::new(
                "archiver_retries_total",
                "Archival attempts scheduled for retry",
            )?,
            terminal_failures: IntCounter::new(
                "archiver_terminal_failures_total",
                "Archival contexts dropped after failing terminally",
            )?,
            deactivations: IntCounter::new(
                "selector_deactivations_total",
                "Storage systems removed from an active set",
            )?,
            extraction_passes: IntCounter::new(
                "extraction_passes_total",
                "Extraction passes over a container",
            )?,
            cache_evictions: IntCounter::new(
                "cache_evictions_total",
                "Files evicted from the local cache",
            )?,
        })
    }

    /// Register every counter on `registry`
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.stored.clone()))?;
        registry.register(Box::new(self.retries.clone()))?;
        registry.register(Box::new(self.terminal_failures.clone()))?;
        registry.register(Box::new(self.deactivations.clone()))?;
        registry.register(Box::new(self.extraction_passes.clone()))?;
        registry.register(Box::new(self.cache_evictions.clone()))?;
        Ok(())
    }
}

impl std::fmt::Debug for ArchiverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiverMetrics")
            .field("stored", &self.stored.get())
            .field("retries", &self.retries.get())
            .field("terminal_failures", &self.terminal_failures.get())
            .field("deactivations", &self.deactivations.get())
            .field("extraction_passes", &self.extraction_passes.get())
            .field("cache_evictions", &self.cache_evictions.get())
            .finish()
    }
}
