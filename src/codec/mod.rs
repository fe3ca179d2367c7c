//! Container Codecs
//!
//! Encode entry batches into ZIP or TAR containers and decode them again.
//! When a manifest name is configured, the manifest is the first entry of the
//! container and every other entry is verified against it while being read.

pub mod manifest;
pub mod tar;
pub mod zip;

pub use self::manifest::{digest_file, DigestReader, DigestState, Manifest};
pub use self::tar::TarCodec;
pub use self::zip::ZipCodec;

use crate::domain::{validate_entries, ArchiveEntry};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

// =============================================================================
// Container Format
// =============================================================================

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Zip,
    Tar,
}

impl ContainerFormat {
    /// Conventional file extension
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Zip => "zip",
            ContainerFormat::Tar => "tar",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// =============================================================================
// Codec Traits
// =============================================================================

/// Receives the entries of a container during [`ContainerCodec::extract_all`]
///
/// The reader handed to the sink yields the entry bytes. When the sink
/// returns early, the codec drains the rest so the digest is still checked;
/// an entry whose digest fails must not be committed by the sink.
pub trait EntrySink {
    fn entry(&mut self, name: &str, data: &mut dyn Read) -> Result<()>;
}

impl<F> EntrySink for F
where
    F: FnMut(&str, &mut dyn Read) -> Result<()>,
{
    fn entry(&mut self, name: &str, data: &mut dyn Read) -> Result<()> {
        self(name, data)
    }
}

/// Streaming encoder/decoder of one container format
pub trait ContainerCodec: Send + Sync {
    /// Format written by this codec
    fn format(&self) -> ContainerFormat;

    /// Name of the manifest entry, if one is written and expected
    fn manifest_name(&self) -> Option<&str>;

    /// Write every entry (manifest first) into `out`
    fn write_entries(
        &self,
        container: &str,
        entries: &[ArchiveEntry],
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Copy the bytes of one entry to `out`, returning the byte count
    fn seek_entry(
        &self,
        container: &str,
        name: &str,
        input: &mut dyn Read,
        out: &mut dyn Write,
    ) -> Result<u64>;

    /// Hand every regular entry to `sink`, verifying digests on the way
    fn extract_all(
        &self,
        container: &str,
        input: &mut dyn Read,
        sink: &mut dyn EntrySink,
    ) -> Result<()>;
}

/// Type alias for Arc'd ContainerCodec
pub type ContainerCodecRef = Arc<dyn ContainerCodec>;

/// Create the codec of a format
pub fn codec_for(format: ContainerFormat, manifest: Option<String>) -> ContainerCodecRef {
    match format {
        ContainerFormat::Zip => Arc::new(ZipCodec::new(manifest)),
        ContainerFormat::Tar => Arc::new(TarCodec::new(manifest)),
    }
}

// =============================================================================
// Shared Encoding Helpers
// =============================================================================

/// Validate the batch and render the manifest bytes, if one is configured
pub(crate) fn prepare_entries(
    container: &str,
    entries: &[ArchiveEntry],
    manifest_name: Option<&str>,
) -> Result<Option<Vec<u8>>> {
    validate_entries(container, entries, manifest_name)?;
    if manifest_name.is_none() {
        return Ok(None);
    }

    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        pairs.push((entry.name.clone(), manifest::entry_digest(entry)?));
    }
    Ok(Some(Manifest::from_pairs(pairs).render()))
}

/// Modification time of a file as seconds since the epoch
pub(crate) fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time as seconds since the epoch
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Manifest Gate
// =============================================================================

/// Per-container decoding state shared by the formats
///
/// Picks up the manifest from the first regular entry and routes every other
/// entry through a [`DigestReader`].
pub(crate) struct ManifestGate<'a> {
    container: &'a str,
    manifest_name: Option<&'a str>,
    manifest: Option<Manifest>,
    first_seen: bool,
}

impl<'a> ManifestGate<'a> {
    pub(crate) fn new(container: &'a str, manifest_name: Option<&'a str>) -> Self {
        Self {
            container,
            manifest_name,
            manifest: None,
            first_seen: false,
        }
    }

    /// Feed one regular entry
    pub(crate) fn on_entry(
        &mut self,
        name: &str,
        data: &mut dyn Read,
        sink: &mut dyn EntrySink,
    ) -> Result<()> {
        let is_manifest = self.manifest_name == Some(name);
        let first = !self.first_seen;
        self.first_seen = true;

        if is_manifest {
            if !first {
                return Err(Error::ManifestMalformed {
                    container: self.container.to_string(),
                    reason: format!("{} is not the first entry", name),
                });
            }
            self.manifest = Some(Manifest::parse(self.container, data)?);
            return Ok(());
        }

        if first && self.manifest_name.is_some() {
            warn!(
                container = %self.container,
                "Container has no manifest, extracting unverified"
            );
        }

        match &self.manifest {
            Some(manifest) => {
                let expected = manifest
                    .digest(name)
                    .ok_or_else(|| self.mismatch(name))?
                    .to_string();
                let mut reader = DigestReader::new(data, &expected);
                let result = sink.entry(name, &mut reader);
                if result.is_ok() {
                    if let Err(e) = reader.drain() {
                        if reader.state() != DigestState::Mismatched {
                            return Err(Error::Io(e));
                        }
                    }
                }
                match reader.state() {
                    DigestState::Mismatched => Err(self.mismatch(name)),
                    DigestState::Reading => result.and(Err(self.mismatch(name))),
                    DigestState::Matched => result,
                }
            }
            None => {
                let result = sink.entry(name, data);
                if result.is_ok() {
                    io::copy(data, &mut io::sink())?;
                }
                result
            }
        }
    }

    fn mismatch(&self, entry: &str) -> Error {
        Error::ChecksumMismatch {
            entry: entry.to_string(),
            container: self.container.to_string(),
        }
    }
}

/// Whether a name is the manifest entry of a codec
pub(crate) fn is_manifest(codec_manifest: Option<&str>, name: &str) -> bool {
    codec_manifest == Some(name)
}
