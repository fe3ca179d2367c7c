//! Error types for the Ring Archiver
//!
//! Provides structured error types for every archiver component including
//! backends, container codecs, extraction, selection and the archival pipeline.

use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the archiver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Object already exists: {system}/{name}")]
    ObjectAlreadyExists { system: String, name: String },

    #[error("Object not found: {system}/{name}")]
    ObjectNotFound { system: String, name: String },

    #[error("Backend unavailable: {system} - {reason}")]
    BackendUnavailable { system: String, reason: String },

    #[error("Unsupported backend scheme: {scheme}")]
    UnsupportedBackend { scheme: String },

    #[error("Unknown storage system: {system}")]
    UnknownSystem { system: String },

    #[error("Invalid object name: {name}")]
    InvalidName { name: String },

    // =========================================================================
    // Container Errors
    // =========================================================================
    #[error("Checksum mismatch for entry {entry} in container {container}")]
    ChecksumMismatch { entry: String, container: String },

    #[error("Malformed manifest in container {container}: {reason}")]
    ManifestMalformed { container: String, reason: String },

    #[error("Duplicate entry {entry} in container {container}")]
    DuplicateEntry { entry: String, container: String },

    #[error("Container {container} failed verification: {reason}")]
    VerificationFailed { container: String, reason: String },

    #[error("Extraction of {container} failed: {source}")]
    ExtractionFailed {
        container: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    // =========================================================================
    // Selection Errors
    // =========================================================================
    #[error("Unknown storage system group: {group}")]
    UnknownGroup { group: String },

    #[error("No eligible backend in group {group} for {requested} bytes")]
    NoEligibleBackend { group: String, requested: u64 },

    #[error("Concurrent update of group {group} after {attempts} attempts")]
    CommitConflict { group: String, attempts: usize },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    #[error("Retries exhausted for container {container} after {retries} retries")]
    RetryExhausted { container: String, retries: u32 },

    #[error("Retry queue closed")]
    QueueClosed,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an archival attempt fails with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Schedule another attempt after the configured retry interval
    Retry,
    /// Give up immediately, retrying cannot change the outcome
    Abandon,
}

impl Error {
    /// Determine what action the pipeline takes for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Invalid input never gets better by waiting
            Error::Configuration(_)
            | Error::UnknownGroup { .. }
            | Error::InvalidName { .. }
            | Error::DuplicateEntry { .. }
            | Error::UnsupportedBackend { .. }
            | Error::CapacityParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::Abandon,

            // Retries already counted
            Error::RetryExhausted { .. } | Error::QueueClosed => ErrorAction::Abandon,

            _ => ErrorAction::Retry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::Retry)
    }

    /// Check if this error names a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ObjectNotFound { .. } => true,
            Error::ExtractionFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Map an I/O error on a named object to the archiver taxonomy
    pub fn from_io(system: &str, name: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::ObjectNotFound {
                system: system.to_string(),
                name: name.to_string(),
            },
            std::io::ErrorKind::AlreadyExists => Error::ObjectAlreadyExists {
                system: system.to_string(),
                name: name.to_string(),
            },
            _ => Error::Io(err),
        }
    }
}

/// Result type alias for the archiver
pub type Result<T> = std::result::Result<T, Error>;
