//! Append-only log stream paired with its CRC file. A crash between the log
//! write and the CRC rename leaves a tail the recovery pass truncates; it
//! never goes unnoticed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::crc::{write_crc, Crc32};

pub struct CrcLog {
    path: PathBuf,
    crc_path: PathBuf,
    file: File,
    crc: Crc32,
}

impl CrcLog {
    /// Open for appending, with the accumulator primed by recovery.
    pub fn open(path: &Path, crc_path: &Path, crc: Crc32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            crc_path: crc_path.to_path_buf(),
            file,
            crc,
        })
    }

    /// Append one delta: write, flush to disk, then commit the new CRC.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.crc.update(bytes);
        write_crc(&self.crc_path, &self.crc)
    }

    /// Replace the whole log with `bytes` (squash): fresh data and CRC temp
    /// files renamed over the targets, then the stream reopens on the new
    /// file.
    pub fn replace(&mut self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .with_context(|| format!("{} has no parent directory", self.path.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("rename squashed log into {}", self.path.display()))?;
        let crc = Crc32::of(bytes);
        write_crc(&self.crc_path, &crc)?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen {}", self.path.display()))?;
        self.crc = crc;
        Ok(())
    }

    /// Truncate to empty and reset the CRC (the engine's `clear`).
    pub fn reset(&mut self) -> Result<()> {
        self.replace(&[])
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file
            .sync_all()
            .with_context(|| format!("sync {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::read_crc;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn append_keeps_crc_file_in_step() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        let crc_path = dir.path().join("a.crc");

        let mut log = CrcLog::open(&path, &crc_path, Crc32::new()).unwrap();
        log.append(b"one").unwrap();
        log.append(b"two").unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes, b"onetwo");
        assert_eq!(read_crc(&crc_path).unwrap(), u64::from(crc32fast::hash(&bytes)));
    }

    #[test]
    fn replace_rewrites_data_and_crc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        let crc_path = dir.path().join("a.crc");

        let mut log = CrcLog::open(&path, &crc_path, Crc32::new()).unwrap();
        log.append(b"aaaaaaaa").unwrap();
        log.replace(b"bb").unwrap();
        // the stream keeps appending after the swap
        log.append(b"cc").unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes, b"bbcc");
        assert_eq!(read_crc(&crc_path).unwrap(), u64::from(crc32fast::hash(&bytes)));
    }
}
