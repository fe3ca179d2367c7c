//! Archival Pipeline
//!
//! Builds one container per [`ArchiverContext`] and stores it on a storage
//! system chosen by the group's selector. Attempts run on the blocking pool;
//! failed attempts are re-submitted through the [`RetryQueue`] until the
//! group's retry budget is spent.
//!
//! ```text
//!   submit ─▶ RetryQueue ─▶ Building ─▶ Selecting ─▶ Writing ─▶ Verifying ─▶ Done
//!                 ▲                                                   │
//!                 └──────────────── RetryScheduled ◀──────────────────┤
//!                                                                     ▼
//!                                                              FailedTerminal
//! ```

pub mod context;
pub mod retry;

pub use context::{ArchiveState, ArchiverContext};
pub use retry::{LocalRetryQueue, RetryHandler, RetryMessage, RetryQueue};

use crate::backend::{BackendFactory, BackendRegistry};
use crate::cache::FileCache;
use crate::codec::manifest::{digest_reader, entry_digest};
use crate::codec::{codec_for, ContainerCodecRef};
use crate::config::{ArchiveConfig, GroupConfig};
use crate::domain::{validate_entries, ArchiveEntry, EntrySource, StorageBackend};
use crate::error::{Error, ErrorAction, Result};
use crate::extraction::ExtractionCoordinator;
use crate::metrics::ArchiverMetrics;
use crate::selector::{GroupRegistry, StorageSystemSelector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Group Policy
// =============================================================================

/// Archival settings of one group
#[derive(Clone)]
pub struct GroupPolicy {
    pub codec: ContainerCodecRef,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub verify: bool,
}

impl GroupPolicy {
    pub fn from_config(config: &GroupConfig) -> Self {
        Self {
            codec: codec_for(config.format, config.manifest.clone()),
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
            verify: config.verify,
        }
    }
}

impl std::fmt::Debug for GroupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPolicy")
            .field("format", &self.codec.format())
            .field("manifest", &self.codec.manifest_name())
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .field("verify", &self.verify)
            .finish()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Outcome notifications broadcast by the archiver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArchiveEvent {
    /// Container written (and verified, if enabled)
    Stored {
        group_id: String,
        container: String,
        system_id: String,
        entries: Vec<String>,
        retries: u32,
        timestamp: DateTime<Utc>,
    },
    /// Context dropped after a terminal failure
    Failed {
        group_id: String,
        container: String,
        retries: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ArchiveEvent {
    pub fn container(&self) -> &str {
        match self {
            ArchiveEvent::Stored { container, .. } | ArchiveEvent::Failed { container, .. } => {
                container
            }
        }
    }
}

// =============================================================================
// Archiver
// =============================================================================

/// Asynchronous, retrying archival of entry batches
pub struct Archiver {
    groups: Arc<GroupRegistry>,
    extraction: Arc<ExtractionCoordinator>,
    policies: DashMap<String, Arc<GroupPolicy>>,
    queue: Arc<dyn RetryQueue>,
    events: broadcast::Sender<ArchiveEvent>,
    metrics: ArchiverMetrics,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Archiver {
    /// Create an archiver delivering attempts through an external queue
    ///
    /// The caller routes delivered messages to [`RetryHandler::handle`].
    pub fn new(
        groups: Arc<GroupRegistry>,
        extraction: Arc<ExtractionCoordinator>,
        queue: Arc<dyn RetryQueue>,
        event_capacity: usize,
        metrics: ArchiverMetrics,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            groups,
            extraction,
            policies: DashMap::new(),
            queue,
            events,
            metrics,
            worker: Mutex::new(None),
        }
    }

    /// Create an archiver with an in-process retry queue
    ///
    /// Must be called within a tokio runtime.
    pub fn with_local_queue(
        groups: Arc<GroupRegistry>,
        extraction: Arc<ExtractionCoordinator>,
        event_capacity: usize,
        metrics: ArchiverMetrics,
    ) -> Arc<Self> {
        let (queue, receiver) = LocalRetryQueue::new();
        let archiver = Arc::new(Self::new(
            groups,
            extraction,
            Arc::new(queue),
            event_capacity,
            metrics,
        ));
        let handler = Arc::new(WeakHandler(Arc::downgrade(&archiver)));
        *archiver.worker.lock() = Some(LocalRetryQueue::spawn_worker(receiver, handler));
        archiver
    }

    /// Wire backends, cache, extraction and groups from configuration
    ///
    /// Must be called within a tokio runtime.
    pub fn from_config(config: &ArchiveConfig, metrics: ArchiverMetrics) -> Result<Arc<Self>> {
        config.validate()?;

        let backends = Arc::new(BackendRegistry::new());
        for group in &config.groups {
            for system in &group.systems {
                backends.insert(BackendFactory::create(system, config.archiver.trace_backends)?);
            }
        }

        let cache = FileCache::open(config.cache.clone(), metrics.clone())?;
        let extraction = Arc::new(ExtractionCoordinator::new(
            backends.clone(),
            cache,
            config.archiver.extraction_policy,
            metrics.clone(),
        ));
        let selector = StorageSystemSelector::new(backends, metrics.clone());
        let groups = Arc::new(GroupRegistry::new(selector, config.archiver.commit_attempts));

        let archiver = Self::with_local_queue(
            groups,
            extraction,
            config.archiver.event_capacity,
            metrics,
        );
        for group in &config.groups {
            archiver.add_group(group)?;
        }
        info!(groups = config.groups.len(), "Archiver started");
        Ok(archiver)
    }

    /// Register a group and its archival policy
    pub fn add_group(&self, config: &GroupConfig) -> Result<()> {
        self.groups.insert(config.to_group()?)?;
        let policy = Arc::new(GroupPolicy::from_config(config));
        for system in &config.systems {
            self.extraction.set_codec(&system.id, policy.codec.clone());
        }
        debug!(group = %config.id, policy = ?policy, "Group policy registered");
        self.policies.insert(config.id.clone(), policy);
        Ok(())
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    pub fn extraction(&self) -> &Arc<ExtractionCoordinator> {
        &self.extraction
    }

    /// Receive archive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    /// Enqueue a context for archival
    ///
    /// Attempt failures are never returned here; they are retried and
    /// finally reported as [`ArchiveEvent::Failed`].
    pub async fn submit(&self, context: ArchiverContext) -> Result<()> {
        self.policy(&context.group_id)?;
        debug!(
            group = %context.group_id,
            container = %context.container,
            entries = context.entries.len(),
            "Submitting archive"
        );
        self.queue
            .schedule(RetryMessage {
                retry_count: context.retries,
                delay_millis: 0,
                context,
            })
            .await
    }

    /// Stop accepting work and wait for scheduled attempts to finish
    pub async fn shutdown(&self) {
        self.queue.close().await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Retry worker terminated abnormally");
            }
        }
        info!("Archiver stopped");
    }

    fn policy(&self, group_id: &str) -> Result<Arc<GroupPolicy>> {
        self.policies
            .get(group_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::UnknownGroup {
                group: group_id.to_string(),
            })
    }

    /// Run one attempt and route its outcome
    async fn process(&self, mut context: ArchiverContext) {
        let policy = match self.policy(&context.group_id) {
            Ok(policy) => policy,
            Err(e) => return self.fail(context, e),
        };

        let attempt = Attempt {
            groups: self.groups.clone(),
            extraction: self.extraction.clone(),
            policy: policy.clone(),
            context: context.clone(),
        };
        let result = tokio::task::spawn_blocking(move || attempt.run())
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("archival attempt aborted: {}", e))));

        match result {
            Ok(system_id) => {
                context.system_id = Some(system_id);
                self.stored(context);
            }
            Err(e) => self.handle_failure(context, &policy, e).await,
        }
    }

    fn stored(&self, context: ArchiverContext) {
        let system_id = context.system_id.clone().unwrap_or_default();
        self.metrics.stored.inc();
        info!(
            group = %context.group_id,
            container = %context.container,
            system = %system_id,
            retries = context.retries,
            state = %ArchiveState::Done,
            "Container archived"
        );
        let _ = self.events.send(ArchiveEvent::Stored {
            group_id: context.group_id.clone(),
            entries: context.entry_names(),
            container: context.container,
            system_id,
            retries: context.retries,
            timestamp: Utc::now(),
        });
    }

    async fn handle_failure(&self, mut context: ArchiverContext, policy: &GroupPolicy, error: Error) {
        if error.action() == ErrorAction::Abandon {
            return self.fail(context, error);
        }
        if context.retries >= policy.max_retries {
            let exhausted = Error::RetryExhausted {
                container: context.container.clone(),
                retries: context.retries,
            };
            warn!(container = %context.container, error = %error, "Last attempt failed");
            return self.fail(context, exhausted);
        }

        context.retries += 1;
        let message = RetryMessage {
            context: context.clone(),
            retry_count: context.retries,
            delay_millis: policy.retry_interval.as_millis() as u64,
        };
        warn!(
            group = %context.group_id,
            container = %context.container,
            retry = context.retries,
            max_retries = policy.max_retries,
            delay_ms = message.delay_millis,
            error = %error,
            state = %ArchiveState::RetryScheduled,
            "Archival attempt failed, retrying"
        );
        match self.queue.schedule(message).await {
            Ok(()) => self.metrics.retries.inc(),
            Err(e) => self.fail(context, e),
        }
    }

    fn fail(&self, context: ArchiverContext, error: Error) {
        self.metrics.terminal_failures.inc();
        error!(
            group = %context.group_id,
            container = %context.container,
            retries = context.retries,
            error = %error,
            state = %ArchiveState::FailedTerminal,
            "Archival failed permanently"
        );
        let _ = self.events.send(ArchiveEvent::Failed {
            group_id: context.group_id,
            container: context.container,
            retries: context.retries,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl RetryHandler for Archiver {
    async fn handle(&self, message: RetryMessage) {
        self.process(message.context).await;
    }
}

/// Handler of the local queue worker; does not keep the archiver alive
struct WeakHandler(Weak<Archiver>);

#[async_trait]
impl RetryHandler for WeakHandler {
    async fn handle(&self, message: RetryMessage) {
        match self.0.upgrade() {
            Some(archiver) => archiver.process(message.context).await,
            None => debug!(container = %message.context.container, "Archiver dropped, discarding attempt"),
        }
    }
}

// =============================================================================
// Attempt
// =============================================================================

/// One blocking archival attempt
struct Attempt {
    groups: Arc<GroupRegistry>,
    extraction: Arc<ExtractionCoordinator>,
    policy: Arc<GroupPolicy>,
    context: ArchiverContext,
}

impl Attempt {
    /// Build, store and verify the container, returning the chosen system
    fn run(self) -> Result<String> {
        let container = self.context.container.as_str();
        let group_id = self.context.group_id.as_str();

        debug!(container, state = %ArchiveState::Building, "Resolving entries");
        let entries = self.resolve_entries()?;
        validate_entries(container, &entries, self.policy.codec.manifest_name())?;
        let mut reserve = 0u64;
        for entry in &entries {
            reserve += fs::metadata(entry.require_local_path()?)?.len();
        }

        debug!(container, reserve, state = %ArchiveState::Selecting, "Selecting storage system");
        let system_id = self
            .groups
            .select(group_id, reserve)?
            .ok_or_else(|| Error::NoEligibleBackend {
                group: group_id.to_string(),
                requested: reserve,
            })?;
        let backend = self.groups.selector().backends().get(&system_id)?;

        debug!(container, system = %system_id, state = %ArchiveState::Writing, "Writing container");
        self.write(backend.as_ref(), &entries)?;

        if self.policy.verify {
            debug!(container, system = %system_id, state = %ArchiveState::Verifying, "Verifying container");
            if let Err(e) = self.verify(backend.as_ref(), &entries) {
                discard(backend.as_ref(), container);
                return Err(e);
            }
        }
        Ok(system_id)
    }

    /// Replace container-sourced entries with their extracted local files
    fn resolve_entries(&self) -> Result<Vec<ArchiveEntry>> {
        self.context
            .entries
            .iter()
            .map(|entry| match &entry.source {
                EntrySource::Path { .. } => Ok(entry.clone()),
                EntrySource::Container {
                    system_id,
                    container,
                    entry: inner,
                } => {
                    let path = self.extraction.request_entry(system_id, container, inner)?;
                    Ok(ArchiveEntry {
                        name: entry.name.clone(),
                        source: EntrySource::Path { path },
                        digest: entry.digest.clone(),
                    })
                }
            })
            .collect()
    }

    fn write(&self, backend: &dyn StorageBackend, entries: &[ArchiveEntry]) -> Result<()> {
        let container = self.context.container.as_str();
        // An occupied name is not ours to clean up
        let mut out = backend.open_write(container)?;
        let written = self
            .policy
            .codec
            .write_entries(container, entries, &mut out)
            .and_then(|_| {
                out.flush()
                    .map_err(|e| Error::from_io(backend.system_id(), container, e))
            });
        drop(out);

        if let Err(e) = written {
            discard(backend, container);
            return Err(e);
        }
        Ok(())
    }

    /// Read the container back and check every entry against its source digest
    fn verify(&self, backend: &dyn StorageBackend, entries: &[ArchiveEntry]) -> Result<()> {
        let container = self.context.container.as_str();
        let mut expected = HashMap::new();
        for entry in entries {
            expected.insert(entry.name.clone(), entry_digest(entry)?);
        }

        let mut seen = BTreeSet::new();
        let mut sink = |name: &str, data: &mut dyn Read| -> Result<()> {
            let digest = digest_reader(data)?;
            if expected.get(name) != Some(&digest) {
                return Err(Error::ChecksumMismatch {
                    entry: name.to_string(),
                    container: container.to_string(),
                });
            }
            seen.insert(name.to_string());
            Ok(())
        };
        let mut input = backend.open_read(container)?;
        self.policy
            .codec
            .extract_all(container, &mut input, &mut sink)?;

        let written: BTreeSet<String> = expected.into_keys().collect();
        if seen != written {
            let missing: Vec<_> = written.difference(&seen).cloned().collect();
            return Err(Error::VerificationFailed {
                container: container.to_string(),
                reason: format!("entries missing after read-back: {}", missing.join(", ")),
            });
        }
        Ok(())
    }
}

/// Best-effort removal of a container we created
fn discard(backend: &dyn StorageBackend, container: &str) {
    match backend.delete(container) {
        Ok(()) => debug!(system = %backend.system_id(), container, "Removed partial container"),
        Err(e) => warn!(
            system = %backend.system_id(),
            container,
            error = %e,
            "Failed to remove partial container"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::{CachePolicy, FileCacheConfig};
    use crate::codec::tests::{extract_map, fixture_entries, flip_in};
    use crate::domain::{Availability, SpaceThreshold};
    use crate::extraction::ExtractionPolicy;
    use crate::selector::registry::DEFAULT_COMMIT_ATTEMPTS;
    use assert_matches::assert_matches;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    /// Memory backend whose writes fail a set number of times
    struct FlakyBackend {
        inner: MemoryBackend,
        failures_left: AtomicU32,
        corrupt_reads: AtomicBool,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryBackend::new("fs1", 1 << 20),
                failures_left: AtomicU32::new(failures),
                corrupt_reads: AtomicBool::new(false),
            }
        }
    }

    impl StorageBackend for FlakyBackend {
        fn system_id(&self) -> &str {
            self.inner.system_id()
        }
        fn check_writable(&self) -> Result<()> {
            self.inner.check_writable()
        }
        fn usable_space(&self) -> Result<u64> {
            self.inner.usable_space()
        }
        fn total_space(&self) -> Result<u64> {
            self.inner.total_space()
        }
        fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                }
                return Err(Error::BackendUnavailable {
                    system: "fs1".to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.inner.open_write(name)
        }
        fn open_read(&self, name: &str) -> Result<Box<dyn Read + Send>> {
            if !self.corrupt_reads.load(Ordering::SeqCst) {
                return self.inner.open_read(name);
            }
            let mut bytes = self.inner.get(name).unwrap().to_vec();
            flip_in(&mut bytes, b"alpha");
            Ok(Box::new(Cursor::new(bytes)))
        }
        fn delete(&self, name: &str) -> Result<()> {
            self.inner.delete(name)
        }
        fn exists(&self, name: &str) -> Result<bool> {
            self.inner.exists(name)
        }
        fn status_markers(&self) -> &[(String, Availability)] {
            self.inner.status_markers()
        }
    }

    struct Fixture {
        archiver: Arc<Archiver>,
        backend: Arc<FlakyBackend>,
        events: broadcast::Receiver<ArchiveEvent>,
        metrics: ArchiverMetrics,
        tmp: TempDir,
    }

    impl Fixture {
        fn new(failures: u32, max_retries: u32, verify: bool) -> Self {
            let tmp = TempDir::new().unwrap();
            let metrics = ArchiverMetrics::new().unwrap();
            let backend = Arc::new(FlakyBackend::new(failures));
            let backends = Arc::new(BackendRegistry::new());
            backends.insert(backend.clone());

            let cache = FileCache::new(
                FileCacheConfig {
                    root: tmp.path().join("cache"),
                    policy: CachePolicy::Lru,
                    min_free_space: SpaceThreshold::Absolute(0),
                },
                metrics.clone(),
            )
            .unwrap();
            let extraction = Arc::new(ExtractionCoordinator::new(
                backends.clone(),
                cache,
                ExtractionPolicy::Lazy,
                metrics.clone(),
            ));
            let selector = StorageSystemSelector::new(backends, metrics.clone());
            let groups = Arc::new(GroupRegistry::new(selector, DEFAULT_COMMIT_ATTEMPTS));

            let archiver = Archiver::with_local_queue(groups, extraction, 16, metrics.clone());
            let config: GroupConfig = serde_yaml::from_str(&format!(
                r#"
id: g1
format: tar
manifest: MANIFEST.sha256
max_retries: {}
retry_interval_ms: 10
verify: {}
systems:
  - {{ id: fs1, uri: "mem://fs1" }}
"#,
                max_retries, verify
            ))
            .unwrap();
            archiver.add_group(&config).unwrap();
            let events = archiver.subscribe();

            Self {
                archiver,
                backend,
                events,
                metrics,
                tmp,
            }
        }

        fn context(&self, container: &str) -> ArchiverContext {
            let entries = fixture_entries(self.tmp.path(), &[("a.txt", "alpha"), ("b/c.txt", "gamma")]);
            ArchiverContext::new("g1", container, entries)
        }

        async fn next_event(&mut self) -> ArchiveEvent {
            tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("no archive event")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_stored_after_two_retries() {
        let mut fx = Fixture::new(2, 2, true);
        fx.archiver.submit(fx.context("c1.tar")).await.unwrap();

        let event = fx.next_event().await;
        assert_matches!(
            &event,
            ArchiveEvent::Stored { system_id, retries: 2, entries, .. }
                if system_id == "fs1" && entries == &vec!["a.txt".to_string(), "b/c.txt".to_string()]
        );
        assert_eq!(fx.metrics.retries.get(), 2);
        assert_eq!(fx.metrics.stored.get(), 1);

        let bytes = fx.backend.inner.get("c1.tar").unwrap();
        let codec = codec_for(crate::codec::ContainerFormat::Tar, Some("MANIFEST.sha256".into()));
        let files = extract_map(codec.as_ref(), &bytes).unwrap();
        assert_eq!(files["a.txt"], b"alpha");

        fx.archiver.shutdown().await;
        assert_matches!(fx.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_terminal_failure_after_retries() {
        let mut fx = Fixture::new(u32::MAX, 2, false);
        fx.archiver.submit(fx.context("c1.tar")).await.unwrap();

        let event = fx.next_event().await;
        assert_matches!(&event, ArchiveEvent::Failed { retries: 2, error, .. } if error.contains("Retries exhausted"));
        assert_eq!(fx.metrics.retries.get(), 2);
        assert_eq!(fx.metrics.terminal_failures.get(), 1);
        assert_eq!(fx.metrics.stored.get(), 0);

        fx.archiver.shutdown().await;
        assert_matches!(fx.events.try_recv(), Err(TryRecvError::Empty));
        assert!(!fx.backend.inner.exists("c1.tar").unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_without_retries() {
        let mut fx = Fixture::new(0, 2, false);
        let mut context = fx.context("c1.tar");
        let duplicate = context.entries[0].clone();
        context.entries.push(duplicate);
        fx.archiver.submit(context).await.unwrap();

        assert_matches!(fx.next_event().await, ArchiveEvent::Failed { retries: 0, .. });
        assert_eq!(fx.metrics.retries.get(), 0);
        fx.archiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_verification_deletes_container() {
        let mut fx = Fixture::new(0, 0, true);
        fx.backend.corrupt_reads.store(true, Ordering::SeqCst);
        fx.archiver.submit(fx.context("c1.tar")).await.unwrap();

        assert_matches!(fx.next_event().await, ArchiveEvent::Failed { .. });
        assert!(!fx.backend.inner.exists("c1.tar").unwrap());
        fx.archiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_existing_container_left_untouched() {
        let mut fx = Fixture::new(0, 0, false);
        fx.backend
            .inner
            .open_write("c1.tar")
            .unwrap()
            .write_all(b"not ours")
            .unwrap();
        fx.archiver.submit(fx.context("c1.tar")).await.unwrap();

        assert_matches!(fx.next_event().await, ArchiveEvent::Failed { .. });
        assert_eq!(fx.backend.inner.get("c1.tar").unwrap().as_ref(), b"not ours");
        fx.archiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_entries_pulled_from_stored_container() {
        let mut fx = Fixture::new(0, 0, true);
        fx.archiver.submit(fx.context("first.tar")).await.unwrap();
        assert_matches!(fx.next_event().await, ArchiveEvent::Stored { .. });

        let context = ArchiverContext::new(
            "g1",
            "second.tar",
            vec![ArchiveEntry::from_container("copy.txt", "fs1", "first.tar", "b/c.txt")],
        );
        fx.archiver.submit(context).await.unwrap();
        assert_matches!(fx.next_event().await, ArchiveEvent::Stored { .. });

        let bytes = fx.backend.inner.get("second.tar").unwrap();
        let codec = codec_for(crate::codec::ContainerFormat::Tar, Some("MANIFEST.sha256".into()));
        let files = extract_map(codec.as_ref(), &bytes).unwrap();
        assert_eq!(files["copy.txt"], b"gamma");
        assert_eq!(fx.archiver.extraction().active_tasks(), 0);
        fx.archiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_unknown_group() {
        let fx = Fixture::new(0, 0, false);
        let context = ArchiverContext::new("nope", "c.tar", Vec::new());
        assert_matches!(
            fx.archiver.submit(context).await,
            Err(Error::UnknownGroup { .. })
        );
    }

    #[test]
    fn test_event_serde() {
        let event = ArchiveEvent::Failed {
            group_id: "g1".into(),
            container: "c.zip".into(),
            retries: 3,
            error: "boom".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"failed\""));
        assert_eq!(event.container(), "c.zip");
    }
}
