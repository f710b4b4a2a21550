//! CRC pairing for append logs. Every log `L` has a sibling `L.crc` holding
//! exactly eight big-endian bytes: the CRC32 of the bytes currently in `L`,
//! widened to u64. The temp-file rename in [`write_crc`] is the commit point
//! for every append.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use crc32fast::Hasher;
use tempfile::NamedTempFile;
use tracing::warn;

/// Incremental CRC32 accumulator over everything appended to one log.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn of(bytes: &[u8]) -> Self {
        let mut crc = Self::new();
        crc.update(bytes);
        crc
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn value(&self) -> u64 {
        u64::from(self.hasher.clone().finalize())
    }

    /// The exact content of the sibling `.crc` file.
    pub fn digest(&self) -> [u8; 8] {
        self.value().to_be_bytes()
    }
}

/// Read a sibling CRC file. Missing, empty, or short files read as 0; the
/// file is rewritten on the log's first append.
pub fn read_crc(path: &Path) -> Result<u64> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "crc file missing, reading as 0");
            return Ok(0);
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    if bytes.len() < 8 {
        warn!(path = %path.display(), len = bytes.len(), "crc file underflow, reading as 0");
        return Ok(0);
    }
    let mut digest = [0u8; 8];
    digest.copy_from_slice(&bytes[..8]);
    Ok(u64::from_be_bytes(digest))
}

/// Atomically replace the sibling CRC file: write the digest to a temp file
/// in the same directory, then rename it over the target.
pub fn write_crc(path: &Path, crc: &Crc32) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&crc.digest())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("rename crc into {}", path.display()))?;
    Ok(())
}
