//! ZIP Codec
//!
//! The ZIP writer seeks back to patch each local header with the final size
//! and CRC, so containers are spooled into an anonymous temp file and copied
//! to the destination afterwards. Reading is fully streaming.

use super::{
    is_manifest, mtime_secs, now_secs, prepare_entries, ContainerCodec, ContainerFormat,
    EntrySink, ManifestGate,
};
use crate::domain::ArchiveEntry;
use crate::error::{Error, Result};
use chrono::{Datelike, Timelike};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use ::zip::read::read_zipfile_from_stream;
use ::zip::write::FileOptions;
use ::zip::{CompressionMethod, DateTime, ZipWriter};

/// ZIP container codec
#[derive(Debug, Clone)]
pub struct ZipCodec {
    manifest: Option<String>,
    compression: CompressionMethod,
}

impl ZipCodec {
    /// Deflate-compressing codec
    pub fn new(manifest: Option<String>) -> Self {
        Self {
            manifest,
            compression: CompressionMethod::Deflated,
        }
    }

    /// Store entries uncompressed
    pub fn stored(mut self) -> Self {
        self.compression = CompressionMethod::Stored;
        self
    }
}

/// ZIP timestamps cover 1980..=2107; anything outside falls back to 1980-01-01
fn zip_time(secs: u64) -> DateTime {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .and_then(|t| {
            DateTime::from_date_and_time(
                t.year() as u16,
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

/// Reports decoder failures (bad CRC, broken deflate stream) as `InvalidData`
struct DecodeErrors<R>(R);

impl<R: Read> Read for DecodeErrors<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| match e.kind() {
            io::ErrorKind::Other | io::ErrorKind::InvalidInput => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            _ => e,
        })
    }
}

impl ContainerCodec for ZipCodec {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Zip
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
        let mut spool = tempfile::tempfile()?;
        {
            let mut writer = ZipWriter::new(&mut spool);
            let options = FileOptions::default().compression_method(self.compression);

            if let (Some(name), Some(bytes)) = (self.manifest_name(), manifest.as_ref()) {
                writer.start_file(name, options.last_modified_time(zip_time(now_secs())))?;
                writer.write_all(bytes)?;
            }

            for entry in entries {
                let mut file = File::open(entry.require_local_path()?)?;
                let meta = file.metadata()?;
                let entry_options = options
                    .last_modified_time(zip_time(mtime_secs(&meta)))
                    .large_file(meta.len() >= u32::MAX as u64);
                writer.start_file(entry.name.as_str(), entry_options)?;
                io::copy(&mut file, &mut writer)?;
            }
            writer.finish()?;
        }

        spool.seek(SeekFrom::Start(0))?;
        io::copy(&mut spool, out)?;
        out.flush()?;
        Ok(())
    }

    fn seek_entry(
        &self,
        container: &str,
        name: &str,
        mut input: &mut dyn Read,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let not_found = || Error::ObjectNotFound {
            system: container.to_string(),
            name: name.to_string(),
        };
        if is_manifest(self.manifest_name(), name) {
            return Err(not_found());
        }

        while let Some(file) = read_zipfile_from_stream(&mut input)? {
            if file.name().trim_end_matches('/') != name {
                continue;
            }
            if file.is_dir() {
                return Err(not_found());
            }
            return Ok(io::copy(&mut DecodeErrors(file), out)?);
        }
        Err(not_found())
    }

    fn extract_all(
        &self,
        container: &str,
        mut input: &mut dyn Read,
        sink: &mut dyn EntrySink,
    ) -> Result<()> {
        let mut gate = ManifestGate::new(container, self.manifest_name());
        while let Some(file) = read_zipfile_from_stream(&mut input)? {
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            gate.on_entry(&name, &mut DecodeErrors(file), sink)?;
        }
        Ok(())
    }
}
