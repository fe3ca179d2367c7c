//! Checksum Manifest
//!
//! The manifest is a UTF-8 text entry with one `<hex-digest> <entry-name>\n`
//! line per container entry, in write order. Digests are SHA-256.

use crate::domain::ArchiveEntry;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

// =============================================================================
// Digests
// =============================================================================

/// Hex digest of everything `reader` yields
pub fn digest_reader(reader: &mut dyn Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex digest of a local file
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    digest_reader(&mut file)
}

/// Digest of an entry, computing it from the source when not supplied
pub fn entry_digest(entry: &ArchiveEntry) -> Result<String> {
    match &entry.digest {
        Some(d) => Ok(d.to_ascii_lowercase()),
        None => Ok(digest_file(entry.require_local_path()?)?),
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Parsed manifest: entry name to expected digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    lines: Vec<(String, String)>,
    by_name: HashMap<String, usize>,
}

impl Manifest {
    /// Build a manifest from `(name, digest)` pairs in write order
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut manifest = Manifest::default();
        for (name, digest) in pairs {
            manifest.by_name.insert(name.clone(), manifest.lines.len());
            manifest.lines.push((name, digest));
        }
        manifest
    }

    /// Parse manifest text
    pub fn parse(container: &str, reader: &mut dyn Read) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| malformed(container, format!("unreadable manifest: {}", e)))?;

        let mut pairs = Vec::new();
        let mut names = std::collections::HashSet::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (digest, name) = line.split_once(' ').ok_or_else(|| {
                malformed(container, format!("line {} has no separator", lineno + 1))
            })?;
            if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(malformed(
                    container,
                    format!("line {} has an invalid digest", lineno + 1),
                ));
            }
            if name.is_empty() || !names.insert(name.to_string()) {
                return Err(malformed(
                    container,
                    format!("line {} repeats or omits the entry name", lineno + 1),
                ));
            }
            pairs.push((name.to_string(), digest.to_ascii_lowercase()));
        }
        Ok(Self::from_pairs(pairs))
    }

    /// Expected digest of an entry
    pub fn digest(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(|i| self.lines[*i].1.as_str())
    }

    /// Number of entries listed
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the manifest lists no entries
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the manifest text
    pub fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, digest) in &self.lines {
            out.push_str(digest);
            out.push(' ');
            out.push_str(name);
            out.push('\n');
        }
        out.into_bytes()
    }
}

fn malformed(container: &str, reason: String) -> Error {
    Error::ManifestMalformed {
        container: container.to_string(),
        reason,
    }
}

// =============================================================================
// Digest Reader
// =============================================================================

/// Outcome of reading an entry through a [`DigestReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestState {
    /// End of entry not reached yet
    Reading,
    /// Digest matched at end of entry
    Matched,
    /// Digest differed, or the format layer reported corrupt data
    Mismatched,
}

/// Read filter hashing the bytes it passes through
///
/// At end of input the digest is compared with the expected one; a mismatch
/// turns the terminating read into an `InvalidData` error so consumers never
/// mistake a corrupt entry for a complete one.
pub struct DigestReader<'a> {
    inner: &'a mut dyn Read,
    hasher: Sha256,
    expected: String,
    state: DigestState,
}

impl<'a> DigestReader<'a> {
    /// Wrap `inner`, expecting the given hex digest
    pub fn new(inner: &'a mut dyn Read, expected: &str) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: expected.to_ascii_lowercase(),
            state: DigestState::Reading,
        }
    }

    /// Current verification state
    pub fn state(&self) -> DigestState {
        self.state
    }

    /// Read the rest of the entry so the digest gets compared
    ///
    /// A mismatch surfaces as `InvalidData` and leaves the state `Mismatched`;
    /// any other error comes from the underlying reader.
    pub fn drain(&mut self) -> io::Result<()> {
        if self.state == DigestState::Reading {
            io::copy(self, &mut io::sink())?;
        }
        Ok(())
    }

    fn mismatch_error() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, "entry digest mismatch")
    }
}

impl Read for DigestReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            DigestState::Mismatched => return Err(Self::mismatch_error()),
            DigestState::Matched => return Ok(0),
            DigestState::Reading => {}
        }

        let n = match self.inner.read(buf) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() == io::ErrorKind::InvalidData {
                    self.state = DigestState::Mismatched;
                }
                return Err(e);
            }
        };

        if n > 0 {
            self.hasher.update(&buf[..n]);
            return Ok(n);
        }

        let actual = hex::encode(self.hasher.clone().finalize());
        if actual == self.expected {
            self.state = DigestState::Matched;
            Ok(0)
        } else {
            self.state = DigestState::Mismatched;
            Err(Self::mismatch_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_reader_matches() {
        let mut src = Cursor::new(b"hello".to_vec());
        let mut reader = DigestReader::new(&mut src, HELLO_SHA256);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.state(), DigestState::Matched);
    }

    #[test]
    fn test_digest_reader_detects_mismatch() {
        let mut src = Cursor::new(b"hellp".to_vec());
        let mut reader = DigestReader::new(&mut src, HELLO_SHA256);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(reader.state(), DigestState::Mismatched);
    }

    #[test]
    fn test_drain_verifies_unread_entry() {
        let mut src = Cursor::new(b"hello".to_vec());
        let mut reader = DigestReader::new(&mut src, HELLO_SHA256);
        assert_eq!(reader.state(), DigestState::Reading);
        reader.drain().unwrap();
        assert_eq!(reader.state(), DigestState::Matched);
    }

    #[test]
    fn test_manifest_render_and_parse() {
        let manifest = Manifest::from_pairs(vec![
            ("a".to_string(), HELLO_SHA256.to_string()),
            ("dir/b".to_string(), HELLO_SHA256.to_uppercase().to_ascii_lowercase()),
        ]);
        let text = manifest.render();
        assert!(String::from_utf8_lossy(&text).starts_with(HELLO_SHA256));

        let parsed = Manifest::parse("c.zip", &mut Cursor::new(text)).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.digest("dir/b"), Some(HELLO_SHA256));
        assert_eq!(parsed.digest("missing"), None);
    }

    #[test]
    fn test_manifest_malformed() {
        let mut no_sep = Cursor::new(b"deadbeef\n".to_vec());
        assert_matches!(
            Manifest::parse("c.zip", &mut no_sep),
            Err(Error::ManifestMalformed { .. })
        );

        let mut short = Cursor::new(b"abc name\n".to_vec());
        assert_matches!(
            Manifest::parse("c.zip", &mut short),
            Err(Error::ManifestMalformed { .. })
        );

        let dup = format!("{0} a\n{0} a\n", HELLO_SHA256);
        assert_matches!(
            Manifest::parse("c.zip", &mut Cursor::new(dup.into_bytes())),
            Err(Error::ManifestMalformed { .. })
        );
    }

    #[test]
    fn test_digest_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"hello").unwrap();
        assert_eq!(digest_file(tmp.path()).unwrap(), HELLO_SHA256);
    }
}
