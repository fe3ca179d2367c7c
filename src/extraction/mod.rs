//! Extraction Coordinator
//!
//! Serves single entries of stored containers from the local file cache.
//! The first request for an uncached entry of a container triggers one pass
//! over the whole container; concurrent requests for any entry of the same
//! container wait on that pass instead of starting their own.
//!
//! ```text
//!   request_entry(fs1, c.zip, a) ──┐
//!   request_entry(fs1, c.zip, b) ──┼──▶ ExtractionTask(fs1/c.zip) ──▶ codec.extract_all
//!   request_entry(fs1, c.zip, c) ──┘        │ resolve(a), resolve(b), ...
//!                                           ▼
//!                                       FileCache
//! ```

use crate::backend::BackendRegistry;
use crate::cache::{FileCache, PART_SUFFIX};
use crate::codec::{codec_for, ContainerCodecRef, ContainerFormat};
use crate::error::{Error, Result};
use crate::metrics::ArchiverMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Extraction Policy
// =============================================================================

/// Which entries an extraction pass materializes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionPolicy {
    /// Only entries somebody is waiting for
    #[default]
    Lazy,
    /// Every entry of the container
    Eager,
}

// =============================================================================
// Extraction Task
// =============================================================================

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Resolved(PathBuf),
}

#[derive(Debug, Default)]
struct TaskState {
    /// Requested or materialized entries
    entries: HashMap<String, EntryState>,
    /// Entries the pass has already read past
    seen: HashSet<String>,
    finished: bool,
    error: Option<Arc<Error>>,
}

/// What a waiter learns about its entry
#[derive(Debug)]
enum Outcome {
    Ready(PathBuf),
    NotFound,
    /// The pass discarded the entry before the request arrived
    Retry,
    Failed(Arc<Error>),
}

/// State of one extraction pass over a container
#[derive(Debug)]
pub struct ExtractionTask {
    system_id: String,
    container: String,
    state: Mutex<TaskState>,
    changed: Condvar,
}

impl ExtractionTask {
    fn new(system_id: &str, container: &str) -> Self {
        Self {
            system_id: system_id.to_string(),
            container: container.to_string(),
            state: Mutex::new(TaskState::default()),
            changed: Condvar::new(),
        }
    }

    /// Storage system holding the container
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Container being extracted
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Number of requests still waiting for their entry
    pub fn pending_requests(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|s| matches!(s, EntryState::Pending))
            .count()
    }

    /// Record interest in an entry unless the pass already read past it
    fn register(&self, entry: &str) {
        let mut state = self.state.lock();
        if !state.seen.contains(entry) && !state.entries.contains_key(entry) {
            state.entries.insert(entry.to_string(), EntryState::Pending);
        }
    }

    /// Mark an entry as read; true when it must be materialized
    fn claim(&self, entry: &str, policy: ExtractionPolicy) -> bool {
        let mut state = self.state.lock();
        state.seen.insert(entry.to_string());
        match policy {
            ExtractionPolicy::Eager => {
                state
                    .entries
                    .entry(entry.to_string())
                    .or_insert(EntryState::Pending);
                true
            }
            ExtractionPolicy::Lazy => matches!(state.entries.get(entry), Some(EntryState::Pending)),
        }
    }

    fn resolve(&self, entry: &str, path: PathBuf) {
        let mut state = self.state.lock();
        state
            .entries
            .insert(entry.to_string(), EntryState::Resolved(path));
        self.changed.notify_all();
    }

    fn finish(&self, error: Option<Error>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.error = error.map(Arc::new);
        self.changed.notify_all();
    }

    /// Block until the entry resolves or the pass terminates
    fn wait(&self, entry: &str) -> Outcome {
        let mut state = self.state.lock();
        loop {
            if let Some(EntryState::Resolved(path)) = state.entries.get(entry) {
                return Outcome::Ready(path.clone());
            }
            if let Some(error) = &state.error {
                return Outcome::Failed(error.clone());
            }
            if state.finished {
                return if state.seen.contains(entry) {
                    Outcome::Retry
                } else {
                    Outcome::NotFound
                };
            }
            self.changed.wait(&mut state);
        }
    }
}

// =============================================================================
// Extraction Coordinator
// =============================================================================

/// Single-flight extraction of container entries into the file cache
pub struct ExtractionCoordinator {
    backends: Arc<BackendRegistry>,
    cache: FileCache,
    policy: ExtractionPolicy,
    /// Codec per storage system, set from the owning group
    codecs: DashMap<String, ContainerCodecRef>,
    tasks: DashMap<String, Arc<ExtractionTask>>,
    metrics: ArchiverMetrics,
}

impl ExtractionCoordinator {
    pub fn new(
        backends: Arc<BackendRegistry>,
        cache: FileCache,
        policy: ExtractionPolicy,
        metrics: ArchiverMetrics,
    ) -> Self {
        Self {
            backends,
            cache,
            policy,
            codecs: DashMap::new(),
            tasks: DashMap::new(),
            metrics,
        }
    }

    /// Decode containers of a storage system with `codec`
    pub fn set_codec(&self, system_id: &str, codec: ContainerCodecRef) {
        self.codecs.insert(system_id.to_string(), codec);
    }

    /// Cache backing this coordinator
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// The running task of a container, if any
    pub fn task(&self, system_id: &str, container: &str) -> Option<Arc<ExtractionTask>> {
        self.tasks
            .get(&task_key(system_id, container))
            .map(|t| t.value().clone())
    }

    /// Number of passes currently running
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Local path of one entry, extracting the container if needed
    ///
    /// Blocks the calling thread while another caller's pass is running.
    pub fn request_entry(&self, system_id: &str, container: &str, entry: &str) -> Result<PathBuf> {
        let path = self.cache.to_path(system_id, container, Some(entry))?;
        let key = task_key(system_id, container);

        loop {
            if self.cache.access(&path) {
                if path.exists() {
                    debug!(system = %system_id, container, entry, "Entry served from cache");
                    return Ok(path);
                }
                self.cache.forget(&path);
            }

            let (task, trigger) = match self.tasks.entry(key.clone()) {
                Entry::Occupied(slot) => (slot.get().clone(), false),
                Entry::Vacant(slot) => {
                    let task = Arc::new(ExtractionTask::new(system_id, container));
                    slot.insert(task.clone());
                    (task, true)
                }
            };

            task.register(entry);
            if trigger {
                self.run(&key, &task);
            }

            match task.wait(entry) {
                Outcome::Ready(path) => return Ok(path),
                Outcome::NotFound => {
                    return Err(Error::ObjectNotFound {
                        system: system_id.to_string(),
                        name: format!("{}/{}", container, entry),
                    })
                }
                Outcome::Failed(source) => {
                    return Err(Error::ExtractionFailed {
                        container: container.to_string(),
                        source,
                    })
                }
                Outcome::Retry => {
                    debug!(
                        system = %system_id,
                        container,
                        entry,
                        "Entry was discarded by a running pass, extracting again"
                    );
                }
            }
        }
    }

    /// Run one pass on the calling thread and publish its outcome
    fn run(&self, key: &str, task: &Arc<ExtractionTask>) {
        self.metrics.extraction_passes.inc();
        info!(system = %task.system_id, container = %task.container, "Extracting container");

        let result = self.extract(task);
        match &result {
            Ok(()) => debug!(container = %task.container, "Extraction pass finished"),
            Err(e) => warn!(container = %task.container, error = %e, "Extraction pass failed"),
        }

        // New requests start a fresh pass from here on
        self.tasks
            .remove_if(key, |_, current| Arc::ptr_eq(current, task));
        task.finish(result.err());
    }

    fn extract(&self, task: &ExtractionTask) -> Result<()> {
        let backend = self.backends.get(&task.system_id)?;
        let codec = self.codec_for(&task.system_id, &task.container);
        let mut input = backend.open_read(&task.container)?;

        let mut sink = |name: &str, data: &mut dyn Read| -> Result<()> {
            if !task.claim(name, self.policy) {
                return Ok(());
            }
            let path = self
                .cache
                .to_path(&task.system_id, &task.container, Some(name))?;
            materialize(&path, data)?;
            self.cache.register(&path)?;
            task.resolve(name, path);
            Ok(())
        };
        codec.extract_all(&task.container, input.as_mut(), &mut sink)
    }

    fn codec_for(&self, system_id: &str, container: &str) -> ContainerCodecRef {
        if let Some(codec) = self.codecs.get(system_id) {
            return codec.value().clone();
        }
        let format = if container.ends_with(".tar") {
            ContainerFormat::Tar
        } else {
            ContainerFormat::Zip
        };
        codec_for(format, None)
    }
}

fn task_key(system_id: &str, container: &str) -> String {
    format!("{}/{}", system_id, container)
}

/// Write `data` to `<path>.part`, then rename it into place
///
/// Any failure removes both files.
pub fn materialize(path: &Path, data: &mut dyn Read) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut part = path.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    let part = PathBuf::from(part);

    let result = (|| -> Result<u64> {
        let mut file = File::create(&part)?;
        let written = io::copy(data, &mut file)?;
        file.sync_all()?;
        fs::rename(&part, path)?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&part);
        let _ = fs::remove_file(path);
    }
    result
}
