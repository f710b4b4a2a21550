//! Read-only view of the DAG. A representation pins the engine's maps by
//! reference at the moment it was built; queries on live state never take
//! the engine lock. Lookups below the sort offset go through the checkpoint
//! tier, which re-acquires the lock so two readers never parse the same
//! checkpoint file twice concurrently.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{ensure, Result};

use blockdag_core::block::{BlockHash, DeployId, Validator, BLOCK_HASH_LENGTH};
use blockdag_core::metadata::BlockMetadata;

use crate::checkpoint::CheckpointedDagInfo;
use crate::error::StoreError;
use crate::StoreInner;

pub struct DagRepresentation {
    pub(crate) latest_messages: Arc<BTreeMap<Validator, BlockHash>>,
    pub(crate) child_map: Arc<HashMap<BlockHash, BTreeSet<BlockHash>>>,
    pub(crate) data_lookup: Arc<HashMap<BlockHash, Arc<BlockMetadata>>>,
    pub(crate) topo_sort: Arc<Vec<Vec<BlockHash>>>,
    pub(crate) block_hashes_by_deploy: Arc<HashMap<DeployId, BlockHash>>,
    pub(crate) invalid_blocks: Arc<BTreeSet<BlockMetadata>>,
    pub(crate) sort_offset: i64,
    pub(crate) store: Arc<StoreInner>,
}

impl DagRepresentation {
    /// Checkpoint snapshot for `hash`, if its number is in the cold tier.
    /// An index entry at or above the sort offset with no live metadata is a
    /// dangling leftover of a torn insert and reads as absent.
    fn checkpointed(&self, hash: &BlockHash) -> Result<Option<Arc<CheckpointedDagInfo>>> {
        let Some(number) = self.store.index.get(hash)? else {
            return Ok(None);
        };
        if number >= self.sort_offset {
            return Ok(None);
        }
        self.store.checkpoint_info(number)
    }

    pub fn children(&self, hash: &BlockHash) -> Result<Option<BTreeSet<BlockHash>>> {
        if let Some(children) = self.child_map.get(hash) {
            return Ok(Some(children.clone()));
        }
        Ok(self
            .checkpointed(hash)?
            .and_then(|info| info.child_map.get(hash).cloned()))
    }

    pub fn lookup(&self, hash: &BlockHash) -> Result<Option<Arc<BlockMetadata>>> {
        if let Some(meta) = self.data_lookup.get(hash) {
            return Ok(Some(meta.clone()));
        }
        Ok(self
            .checkpointed(hash)?
            .and_then(|info| info.data_lookup.get(hash).cloned()))
    }

    pub fn contains(&self, hash: &BlockHash) -> Result<bool> {
        if hash.len() != BLOCK_HASH_LENGTH {
            return Ok(false);
        }
        if self.data_lookup.contains_key(hash) {
            return Ok(true);
        }
        match self.store.index.get(hash)? {
            Some(number) => Ok(number < self.sort_offset),
            None => Ok(false),
        }
    }

    /// Memory only; deploys never migrate into checkpoints.
    pub fn lookup_by_deploy_id(&self, deploy: &DeployId) -> Option<BlockHash> {
        self.block_hashes_by_deploy.get(deploy).cloned()
    }

    /// Rows for every block number from `start_block_number` up: checkpoint
    /// slices first (loaded under the engine lock), then the live rows.
    pub fn topo_sort(&self, start_block_number: i64) -> Result<Vec<Vec<BlockHash>>> {
        let rows = if start_block_number >= self.sort_offset {
            let skip = (start_block_number - self.sort_offset) as usize;
            self.topo_sort.iter().skip(skip).cloned().collect::<Vec<_>>()
        } else {
            let mut rows = self
                .store
                .checkpoint_topo_rows(start_block_number, self.sort_offset)?;
            rows.extend(self.topo_sort.iter().cloned());
            rows
        };
        if rows.len() > i32::MAX as usize {
            return Err(StoreError::TopoSortLengthIsTooBig {
                length: rows.len() as u64,
            }
            .into());
        }
        Ok(rows)
    }

    /// The last `n` rows.
    // TODO: the start formula can undershoot by one row when the tail spans
    // a checkpoint boundary; topo_tail_formula_is_pinned documents the
    // current behavior.
    pub fn topo_sort_tail(&self, n: i64) -> Result<Vec<Vec<BlockHash>>> {
        let live_len = self.topo_sort.len() as i64;
        let start = (self.sort_offset - (n - live_len)).max(0);
        self.topo_sort(start)
    }

    /// Total order over metadata by position in the flattened sort from
    /// `start_block_number`.
    pub fn derive_ordering(&self, start_block_number: i64) -> Result<TopoOrdering> {
        let rows = self.topo_sort(start_block_number)?;
        let mut positions = HashMap::new();
        let mut position = 0u64;
        for row in rows {
            for hash in row {
                positions.insert(hash, position);
                position += 1;
            }
        }
        Ok(TopoOrdering { positions })
    }

    pub fn latest_message(&self, validator: &Validator) -> Result<Option<Arc<BlockMetadata>>> {
        match self.latest_messages.get(validator) {
            Some(hash) => self.lookup(hash),
            None => Ok(None),
        }
    }

    pub fn latest_message_hash(&self, validator: &Validator) -> Option<BlockHash> {
        self.latest_messages.get(validator).cloned()
    }

    pub fn latest_message_hashes(&self) -> &BTreeMap<Validator, BlockHash> {
        &self.latest_messages
    }

    /// Every latest message resolved to its metadata. Hashes that resolve to
    /// nothing (the post-crash dangling window) are skipped.
    pub fn latest_messages(&self) -> Result<BTreeMap<Validator, Arc<BlockMetadata>>> {
        let mut out = BTreeMap::new();
        for (validator, hash) in self.latest_messages.iter() {
            if let Some(meta) = self.lookup(hash)? {
                out.insert(validator.clone(), meta);
            }
        }
        Ok(out)
    }

    pub fn invalid_blocks(&self) -> &BTreeSet<BlockMetadata> {
        &self.invalid_blocks
    }

    /// Diagnostic scan: the live maps, the topological sort, and the block
    /// number index must agree. Never called on the hot path.
    pub fn verify_integrity(&self) -> Result<()> {
        for (hash, meta) in self.data_lookup.iter() {
            ensure!(
                self.child_map.contains_key(hash),
                "no child map entry for {}",
                hex::encode(hash)
            );
            for parent in &meta.parents {
                let linked = self
                    .child_map
                    .get(parent)
                    .map_or(false, |children| children.contains(hash));
                ensure!(
                    linked,
                    "child edge {} -> {} missing",
                    hex::encode(parent),
                    hex::encode(hash)
                );
            }
            ensure!(
                meta.block_num >= self.sort_offset,
                "live block {} numbered {} below the sort offset {}",
                hex::encode(hash),
                meta.block_num,
                self.sort_offset
            );
            let row = (meta.block_num - self.sort_offset) as usize;
            ensure!(
                self.topo_sort.get(row).map_or(false, |r| r.contains(hash)),
                "{} missing from topo row {}",
                hex::encode(hash),
                row
            );
            ensure!(
                self.store.index.get(hash)? == Some(meta.block_num),
                "{} missing from the block number index",
                hex::encode(hash)
            );
        }
        for (validator, hash) in self.latest_messages.iter() {
            ensure!(
                self.contains(hash)?,
                "latest message of {} points at unknown block {}",
                hex::encode(validator),
                hex::encode(hash)
            );
        }
        Ok(())
    }
}

/// Position table over the flattened topological sort. Blocks outside the
/// sort order last, tied by hash.
pub struct TopoOrdering {
    positions: HashMap<BlockHash, u64>,
}

impl TopoOrdering {
    pub fn position(&self, hash: &BlockHash) -> Option<u64> {
        self.positions.get(hash).copied()
    }

    pub fn cmp(&self, a: &BlockMetadata, b: &BlockMetadata) -> Ordering {
        let pa = self.position(&a.block_hash).unwrap_or(u64::MAX);
        let pb = self.position(&b.block_hash).unwrap_or(u64::MAX);
        (pa, &a.block_hash).cmp(&(pb, &b.block_hash))
    }
}
