//! Record framing and log recovery.
//!
//! Every log is replayed in full at open and validated against its sibling
//! CRC. Three repairable shapes, in the order they are tried:
//!
//!  - the stored CRC covers everything decoded: accept, dropping any torn
//!    trailing bytes the CRC never covered;
//!  - the stored CRC covers everything but the final record: the append ran
//!    but its CRC rename did not; drop the final record and truncate;
//!  - the stored CRC ran ahead of a tail the file system never persisted
//!    (torn tail): accept the decoded prefix and truncate the partial bytes.
//!
//! Anything else is fatal and leaves the file untouched for inspection.
//! At most one record per log is ever dropped, and never silently.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use blockdag_core::block::{BlockHash, DeployId, Validator, BLOCK_HASH_LENGTH, VALIDATOR_LENGTH};
use blockdag_core::equivocation::EquivocationRecord;
use blockdag_core::metadata::BlockMetadata;

use crate::crc::{read_crc, write_crc, Crc32};
use crate::error::StoreError;

// --- record framing ---------------------------------------------------------

pub(crate) fn encode_latest_message(validator: &Validator, hash: &BlockHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(VALIDATOR_LENGTH + BLOCK_HASH_LENGTH);
    out.extend_from_slice(validator);
    out.extend_from_slice(hash);
    out
}

/// `size:i32 || bytes[size]`, big-endian; shared by the block-metadata and
/// invalid-blocks logs and by checkpoint files.
pub(crate) fn encode_size_prefixed(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

pub(crate) fn encode_deploy(deploy: &DeployId, hash: &BlockHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + deploy.len() + BLOCK_HASH_LENGTH);
    out.extend_from_slice(&(deploy.len() as i32).to_be_bytes());
    out.extend_from_slice(deploy);
    out.extend_from_slice(hash);
    out
}

// --- decoding ----------------------------------------------------------------

struct Decoded<T> {
    records: Vec<T>,
    frame_lens: Vec<usize>,
    /// Bytes past the last whole frame (a torn tail), if any.
    trailing: usize,
}

impl<T> Decoded<T> {
    fn consumed(&self) -> usize {
        self.frame_lens.iter().sum()
    }
}

fn read_i32_be(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode_fixed_width(bytes: &[u8], width: usize) -> Decoded<Vec<u8>> {
    let n = bytes.len() / width;
    Decoded {
        records: bytes.chunks_exact(width).map(|c| c.to_vec()).collect(),
        frame_lens: vec![width; n],
        trailing: bytes.len() - n * width,
    }
}

/// Frames of `size:i32 || payload`. A negative size is structural damage,
/// not a tail; `None` is returned and the caller raises its log error.
fn decode_size_prefixed(bytes: &[u8]) -> Option<Decoded<Vec<u8>>> {
    let mut dec = Decoded {
        records: Vec::new(),
        frame_lens: Vec::new(),
        trailing: 0,
    };
    let mut pos = 0;
    loop {
        let rem = &bytes[pos..];
        if rem.len() < 4 {
            dec.trailing = rem.len();
            return Some(dec);
        }
        let size = read_i32_be(rem);
        if size < 0 {
            return None;
        }
        let frame = 4 + size as usize;
        if rem.len() < frame {
            dec.trailing = rem.len();
            return Some(dec);
        }
        dec.records.push(rem[4..frame].to_vec());
        dec.frame_lens.push(frame);
        pos += frame;
    }
}

/// Frames of `validator || seq:i32 || count:i32 || hash*count`.
fn decode_equivocations(bytes: &[u8]) -> Option<Decoded<EquivocationRecord>> {
    const HEADER: usize = VALIDATOR_LENGTH + 8;
    let mut dec = Decoded {
        records: Vec::new(),
        frame_lens: Vec::new(),
        trailing: 0,
    };
    let mut pos = 0;
    loop {
        let rem = &bytes[pos..];
        if rem.len() < HEADER {
            dec.trailing = rem.len();
            return Some(dec);
        }
        let seq_num = read_i32_be(&rem[VALIDATOR_LENGTH..]);
        let count = read_i32_be(&rem[VALIDATOR_LENGTH + 4..]);
        if count < 0 {
            return None;
        }
        let frame = HEADER + count as usize * BLOCK_HASH_LENGTH;
        if rem.len() < frame {
            dec.trailing = rem.len();
            return Some(dec);
        }
        let hashes = rem[HEADER..frame]
            .chunks_exact(BLOCK_HASH_LENGTH)
            .map(|c| c.to_vec())
            .collect();
        dec.records.push(EquivocationRecord::new(
            rem[..VALIDATOR_LENGTH].to_vec(),
            seq_num,
            hashes,
        ));
        dec.frame_lens.push(frame);
        pos += frame;
    }
}

/// Frames of `deploy_size:i32 || deploy_id || block_hash`.
fn decode_deploys(bytes: &[u8]) -> Option<Decoded<(DeployId, BlockHash)>> {
    let mut dec = Decoded {
        records: Vec::new(),
        frame_lens: Vec::new(),
        trailing: 0,
    };
    let mut pos = 0;
    loop {
        let rem = &bytes[pos..];
        if rem.len() < 4 {
            dec.trailing = rem.len();
            return Some(dec);
        }
        let size = read_i32_be(rem);
        if size < 0 {
            return None;
        }
        let frame = 4 + size as usize + BLOCK_HASH_LENGTH;
        if rem.len() < frame {
            dec.trailing = rem.len();
            return Some(dec);
        }
        dec.records.push((
            rem[4..4 + size as usize].to_vec(),
            rem[4 + size as usize..frame].to_vec(),
        ));
        dec.frame_lens.push(frame);
        pos += frame;
    }
}

// --- validation and repair ---------------------------------------------------

/// The decoded records a log holds after repair, plus the accumulator the
/// append stream continues from.
pub(crate) struct RecoveredLog<T> {
    pub records: Vec<T>,
    pub crc: Crc32,
}

fn validate_and_repair<T>(
    path: &Path,
    bytes: &[u8],
    stored: u64,
    mut dec: Decoded<T>,
    fatal: impl FnOnce() -> StoreError,
) -> Result<(Vec<T>, usize, Crc32)> {
    let consumed = dec.consumed();
    let full = Crc32::of(&bytes[..consumed]);
    if full.value() == stored {
        return Ok((dec.records, consumed, full));
    }
    if let Some(&last) = dec.frame_lens.last() {
        let head_len = consumed - last;
        let head = Crc32::of(&bytes[..head_len]);
        if head.value() == stored {
            warn!(
                path = %path.display(),
                "stored crc excludes the final record, dropping it"
            );
            dec.records.pop();
            return Ok((dec.records, head_len, head));
        }
    }
    if dec.trailing > 0 {
        warn!(
            path = %path.display(),
            trailing = dec.trailing,
            "torn tail past the last whole record, dropping partial bytes"
        );
        return Ok((dec.records, consumed, full));
    }
    Err(fatal().into())
}

fn read_log_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// Truncate repaired bytes off the tail and re-sync the CRC file when the
/// stored value could not be kept (the torn-tail case).
fn commit_repair(
    path: &Path,
    crc_path: &Path,
    file_len: usize,
    accepted_len: usize,
    stored: u64,
    crc: &Crc32,
) -> Result<()> {
    if accepted_len < file_len {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open {} for truncation", path.display()))?;
        file.set_len(accepted_len as u64)?;
        file.sync_all()?;
    }
    if crc.value() != stored {
        write_crc(crc_path, crc)?;
    }
    Ok(())
}

// --- per-log recovery --------------------------------------------------------

pub(crate) fn recover_latest_messages(
    path: &Path,
    crc_path: &Path,
) -> Result<RecoveredLog<(Validator, BlockHash)>> {
    let bytes = read_log_or_empty(path)?;
    let stored = read_crc(crc_path)?;
    let dec = decode_fixed_width(&bytes, VALIDATOR_LENGTH + BLOCK_HASH_LENGTH);
    let (raw, accepted, crc) = validate_and_repair(path, &bytes, stored, dec, || {
        StoreError::LatestMessagesLogIsMalformed { path: path.into() }
    })?;
    commit_repair(path, crc_path, bytes.len(), accepted, stored, &crc)?;
    let records = raw
        .into_iter()
        .map(|rec| {
            (
                rec[..VALIDATOR_LENGTH].to_vec(),
                rec[VALIDATOR_LENGTH..].to_vec(),
            )
        })
        .collect::<Vec<_>>();
    debug!(path = %path.display(), records = records.len(), "latest messages log recovered");
    Ok(RecoveredLog { records, crc })
}

fn recover_metadata_log(
    path: &Path,
    crc_path: &Path,
    fatal: impl Fn() -> StoreError,
) -> Result<RecoveredLog<BlockMetadata>> {
    let bytes = read_log_or_empty(path)?;
    let stored = read_crc(crc_path)?;
    let dec = decode_size_prefixed(&bytes).ok_or_else(&fatal)?;
    let (frames, accepted, crc) = validate_and_repair(path, &bytes, stored, dec, &fatal)?;
    commit_repair(path, crc_path, bytes.len(), accepted, stored, &crc)?;
    let records = frames
        .iter()
        .map(|frame| BlockMetadata::from_bytes(frame).map_err(|_| fatal()))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(path = %path.display(), records = records.len(), "metadata log recovered");
    Ok(RecoveredLog { records, crc })
}

pub(crate) fn recover_block_metadata(
    path: &Path,
    crc_path: &Path,
) -> Result<RecoveredLog<BlockMetadata>> {
    recover_metadata_log(path, crc_path, || StoreError::DataLookupIsCorrupted {
        path: path.into(),
    })
}

pub(crate) fn recover_invalid_blocks(
    path: &Path,
    crc_path: &Path,
) -> Result<RecoveredLog<BlockMetadata>> {
    recover_metadata_log(path, crc_path, || StoreError::InvalidBlocksIsCorrupted {
        path: path.into(),
    })
}

pub(crate) fn recover_equivocations(
    path: &Path,
    crc_path: &Path,
) -> Result<RecoveredLog<EquivocationRecord>> {
    let bytes = read_log_or_empty(path)?;
    let stored = read_crc(crc_path)?;
    let dec = decode_equivocations(&bytes).ok_or_else(|| {
        StoreError::EquivocationsTrackerLogIsMalformed { path: path.into() }
    })?;
    let (records, accepted, crc) = validate_and_repair(path, &bytes, stored, dec, || {
        StoreError::EquivocationsTrackerLogIsMalformed { path: path.into() }
    })?;
    commit_repair(path, crc_path, bytes.len(), accepted, stored, &crc)?;
    debug!(path = %path.display(), records = records.len(), "equivocations log recovered");
    Ok(RecoveredLog { records, crc })
}

pub(crate) fn recover_deploy_index(
    path: &Path,
    crc_path: &Path,
) -> Result<RecoveredLog<(DeployId, BlockHash)>> {
    let bytes = read_log_or_empty(path)?;
    let stored = read_crc(crc_path)?;
    let dec = decode_deploys(&bytes).ok_or_else(|| {
        StoreError::BlockHashesByDeployLogIsCorrupted { path: path.into() }
    })?;
    let (records, accepted, crc) = validate_and_repair(path, &bytes, stored, dec, || {
        StoreError::BlockHashesByDeployLogIsCorrupted { path: path.into() }
    })?;
    commit_repair(path, crc_path, bytes.len(), accepted, stored, &crc)?;
    debug!(path = %path.display(), records = records.len(), "deploy index log recovered");
    Ok(RecoveredLog { records, crc })
}

/// Collapse the replayed equivocation revisions, last write wins per
/// (equivocator, base sequence number).
pub(crate) fn squash_equivocations(
    records: Vec<EquivocationRecord>,
) -> impl Iterator<Item = EquivocationRecord> {
    let mut latest: BTreeMap<(Validator, i32), EquivocationRecord> = BTreeMap::new();
    for record in records {
        latest.insert(
            (
                record.equivocator.clone(),
                record.equivocation_base_block_seq_num,
            ),
            record,
        );
    }
    latest.into_values()
}

/// Decode one checkpoint file: the block-metadata framing, but immutable,
/// so any damage is fatal.
pub(crate) fn read_checkpoint_records(path: &Path) -> Result<Vec<BlockMetadata>> {
    let bytes = fs::read(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let corrupted = || StoreError::DataLookupIsCorrupted { path: path.into() };
    let dec = decode_size_prefixed(&bytes).ok_or_else(corrupted)?;
    if dec.trailing > 0 {
        return Err(corrupted().into());
    }
    dec.records
        .iter()
        .map(|frame| BlockMetadata::from_bytes(frame).map_err(|_| corrupted().into()))
        .collect()
}
