//! TAR Codec
//!
//! Entry sizes are known before each header is emitted, so the archive is
//! streamed straight into the destination without buffering.

use super::{
    is_manifest, mtime_secs, now_secs, prepare_entries, ContainerCodec, ContainerFormat,
    EntrySink, ManifestGate,
};
use crate::domain::ArchiveEntry;
use crate::error::{Error, Result};
use ::tar::{Archive, Builder, EntryType, Header};
use std::fs::File;
use std::io::{self, Read, Write};

/// TAR container codec
#[derive(Debug, Clone, Default)]
pub struct TarCodec {
    manifest: Option<String>,
}

impl TarCodec {
    pub fn new(manifest: Option<String>) -> Self {
        Self { manifest }
    }
}

fn regular_header(size: u64, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header
}

fn entry_name<R: Read>(entry: &::tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    path.to_str()
        .map(|s| s.trim_end_matches('/').to_string())
        .ok_or_else(|| Error::InvalidName {
            name: path.to_string_lossy().into_owned(),
        })
}

impl ContainerCodec for TarCodec {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Tar
    }

    fn manifest_name(&self) -> Option<&str> {
        self.manifest.as_deref()
    }

    fn write_entries(
        &self,
        container: &str,
        entries: &[ArchiveEntry],
        out: &mut dyn Write,
    ) -> Result<()> {
        let manifest = prepare_entries(container, entries, self.manifest_name())?;
        let mut builder = Builder::new(out);

        if let (Some(name), Some(bytes)) = (self.manifest_name(), manifest.as_ref()) {
            let mut header = regular_header(bytes.len() as u64, now_secs());
            builder.append_data(&mut header, name, bytes.as_slice())?;
        }

        for entry in entries {
            let file = File::open(entry.require_local_path()?)?;
            let meta = file.metadata()?;
            let mut header = regular_header(meta.len(), mtime_secs(&meta));
            builder.append_data(&mut header, &entry.name, file)?;
        }

        builder.into_inner()?.flush()?;
        Ok(())
    }

    fn seek_entry(
        &self,
        container: &str,
        name: &str,
        input: &mut dyn Read,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let not_found = || Error::ObjectNotFound {
            system: container.to_string(),
            name: name.to_string(),
        };
        if is_manifest(self.manifest_name(), name) {
            return Err(not_found());
        }

        let mut archive = Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry_name(&entry)? != name {
                continue;
            }
            if !entry.header().entry_type().is_file() {
                return Err(not_found());
            }
            return Ok(io::copy(&mut entry, out)?);
        }
        Err(not_found())
    }

    fn extract_all(
        &self,
        container: &str,
        input: &mut dyn Read,
        sink: &mut dyn EntrySink,
    ) -> Result<()> {
        let mut gate = ManifestGate::new(container, self.manifest_name());
        let mut archive = Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry_name(&entry)?;
            gate.on_entry(&name, &mut entry, sink)?;
        }
        Ok(())
    }
}
