//! Checkpointed cold tier: immutable on-disk snapshots of historical block
//! metadata, each covering a contiguous `[start, end)` range of block
//! numbers. Files are named `<start>-<end>` and must chain from zero with no
//! gaps. Parsed snapshots are cached behind weak references so memory
//! pressure can reclaim them; reconstruction from the file bytes is
//! idempotent.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use blockdag_core::block::BlockHash;
use blockdag_core::metadata::BlockMetadata;

use crate::error::StoreError;
use crate::recovery::read_checkpoint_records;
use crate::state::add_to_topo;

static CHECKPOINT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)-([0-9]+)$").expect("checkpoint name regex"));

pub(crate) struct Checkpoint {
    pub start: i64,
    pub end: i64,
    pub path: PathBuf,
    /// Weak cache of the parsed snapshot; reloaded from `path` when evicted.
    pub dag_info: Weak<CheckpointedDagInfo>,
}

/// Snapshot reconstructed from one checkpoint file.
pub struct CheckpointedDagInfo {
    pub child_map: HashMap<BlockHash, BTreeSet<BlockHash>>,
    pub data_lookup: HashMap<BlockHash, Arc<BlockMetadata>>,
    pub topo_sort: Vec<Vec<BlockHash>>,
    pub sort_offset: i64,
}

/// List, parse, and validate the checkpoint directory. Regular files whose
/// names do not parse are warned about and skipped; gaps and a nonzero first
/// start are fatal.
pub(crate) fn load_checkpoints(dir: &Path) -> Result<Vec<Checkpoint>> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let parsed = CHECKPOINT_NAME.captures(&name).and_then(|caps| {
            let start = caps[1].parse::<i64>().ok()?;
            let end = caps[2].parse::<i64>().ok()?;
            Some((start, end))
        });
        match parsed {
            Some((start, end)) => checkpoints.push(Checkpoint {
                start,
                end,
                path: entry.path(),
                dag_info: Weak::new(),
            }),
            None => {
                warn!(file = %name, dir = %dir.display(), "ignoring file in checkpoints directory");
            }
        }
    }
    checkpoints.sort_by_key(|c| c.start);

    let paths = || checkpoints.iter().map(|c| c.path.clone()).collect::<Vec<_>>();
    if let Some(first) = checkpoints.first() {
        if first.start != 0 {
            return Err(StoreError::CheckpointsDoNotStartFromZero { paths: paths() }.into());
        }
    }
    if checkpoints.windows(2).any(|w| w[0].end != w[1].start) {
        return Err(StoreError::CheckpointsAreNotConsecutive { paths: paths() }.into());
    }
    Ok(checkpoints)
}

/// Parse a checkpoint file into its derived indices. Child edges and the
/// topological rows are recomputed from the parent pointers, so the file
/// only carries metadata records.
pub(crate) fn load_checkpoint_dag_info(checkpoint: &Checkpoint) -> Result<CheckpointedDagInfo> {
    let records = read_checkpoint_records(&checkpoint.path)?;
    let mut info = CheckpointedDagInfo {
        child_map: HashMap::new(),
        data_lookup: HashMap::new(),
        topo_sort: Vec::new(),
        sort_offset: checkpoint.start,
    };
    for metadata in records {
        let hash = metadata.block_hash.clone();
        info.child_map.entry(hash.clone()).or_default();
        for parent in &metadata.parents {
            info.child_map
                .entry(parent.clone())
                .or_default()
                .insert(hash.clone());
        }
        add_to_topo(
            &mut info.topo_sort,
            checkpoint.start,
            metadata.block_num,
            hash.clone(),
        );
        info.data_lookup.insert(hash, Arc::new(metadata));
    }
    Ok(info)
}
