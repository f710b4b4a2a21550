//! In-memory aggregate of the DAG. Maps are held behind `Arc` so a
//! representation snapshot is a handful of pointer copies; mutation goes
//! through `Arc::make_mut`, which only clones a map while an older snapshot
//! is still alive.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use blockdag_core::block::{BlockHash, DeployId, Validator};
use blockdag_core::equivocation::EquivocationRecord;
use blockdag_core::metadata::BlockMetadata;

use crate::checkpoint::Checkpoint;

pub(crate) struct DagState {
    pub latest_messages: Arc<BTreeMap<Validator, BlockHash>>,
    pub child_map: Arc<HashMap<BlockHash, BTreeSet<BlockHash>>>,
    pub data_lookup: Arc<HashMap<BlockHash, Arc<BlockMetadata>>>,
    /// Row `i` holds the hashes of blocks with `block_num == sort_offset + i`.
    pub topo_sort: Arc<Vec<Vec<BlockHash>>>,
    pub block_hashes_by_deploy: Arc<HashMap<DeployId, BlockHash>>,
    pub equivocations_tracker: Arc<BTreeSet<EquivocationRecord>>,
    pub invalid_blocks: Arc<BTreeSet<BlockMetadata>>,
    /// First live block number; everything below lives in a checkpoint.
    pub sort_offset: i64,
    pub checkpoints: Vec<Checkpoint>,
    /// Appends to the latest-messages log since its last squash.
    pub latest_messages_log_size: i32,
}

impl DagState {
    pub fn empty() -> Self {
        Self {
            latest_messages: Arc::new(BTreeMap::new()),
            child_map: Arc::new(HashMap::new()),
            data_lookup: Arc::new(HashMap::new()),
            topo_sort: Arc::new(Vec::new()),
            block_hashes_by_deploy: Arc::new(HashMap::new()),
            equivocations_tracker: Arc::new(BTreeSet::new()),
            invalid_blocks: Arc::new(BTreeSet::new()),
            sort_offset: 0,
            checkpoints: Vec::new(),
            latest_messages_log_size: 0,
        }
    }

    /// Materialize state from the replayed logs. `latest` and `deploys` fold
    /// left to right (last write wins), mirroring append order.
    pub fn from_recovered(
        latest: Vec<(Validator, BlockHash)>,
        metadata: Vec<BlockMetadata>,
        equivocations: BTreeSet<EquivocationRecord>,
        invalid: Vec<BlockMetadata>,
        deploys: Vec<(DeployId, BlockHash)>,
        checkpoints: Vec<Checkpoint>,
    ) -> Self {
        let sort_offset = checkpoints.last().map(|c| c.end).unwrap_or(0);
        let latest_messages_log_size = latest.len() as i32;

        let mut latest_messages = BTreeMap::new();
        for (validator, hash) in latest {
            latest_messages.insert(validator, hash);
        }

        let mut child_map: HashMap<BlockHash, BTreeSet<BlockHash>> = HashMap::new();
        let mut data_lookup = HashMap::new();
        let mut topo_sort = Vec::new();
        for meta in metadata {
            let hash = meta.block_hash.clone();
            child_map.entry(hash.clone()).or_default();
            for parent in &meta.parents {
                child_map
                    .entry(parent.clone())
                    .or_default()
                    .insert(hash.clone());
            }
            add_to_topo(&mut topo_sort, sort_offset, meta.block_num, hash.clone());
            data_lookup.insert(hash, Arc::new(meta));
        }

        let mut block_hashes_by_deploy = HashMap::new();
        for (deploy, hash) in deploys {
            block_hashes_by_deploy.insert(deploy, hash);
        }

        Self {
            latest_messages: Arc::new(latest_messages),
            child_map: Arc::new(child_map),
            data_lookup: Arc::new(data_lookup),
            topo_sort: Arc::new(topo_sort),
            block_hashes_by_deploy: Arc::new(block_hashes_by_deploy),
            equivocations_tracker: Arc::new(equivocations),
            invalid_blocks: Arc::new(invalid.into_iter().collect()),
            sort_offset,
            checkpoints,
            latest_messages_log_size,
        }
    }
}

/// Append `hash` to the row holding its block number, growing the sort with
/// empty rows as needed. Pure over its inputs; shared by the live write path
/// and checkpoint reconstruction.
pub(crate) fn add_to_topo(
    topo_sort: &mut Vec<Vec<BlockHash>>,
    sort_offset: i64,
    block_num: i64,
    hash: BlockHash,
) {
    if block_num < sort_offset {
        // already covered by a checkpoint; nothing to place in the live sort
        warn!(
            block_num,
            sort_offset,
            hash = %hex::encode(&hash),
            "block number below the sort offset, skipping topo placement"
        );
        return;
    }
    let idx = (block_num - sort_offset) as usize;
    while topo_sort.len() <= idx {
        topo_sort.push(Vec::new());
    }
    topo_sort[idx].push(hash);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn topo_rows_grow_on_demand() {
        let mut topo = Vec::new();
        add_to_topo(&mut topo, 10, 10, vec![1]);
        add_to_topo(&mut topo, 10, 13, vec![2]);
        add_to_topo(&mut topo, 10, 13, vec![3]);
        assert_eq!(
            topo,
            vec![vec![vec![1]], vec![], vec![], vec![vec![2], vec![3]]]
        );
    }

    #[test]
    fn below_offset_is_skipped() {
        let mut topo = Vec::new();
        add_to_topo(&mut topo, 10, 9, vec![1]);
        assert!(topo.is_empty());
    }

    #[test]
    fn recovered_latest_messages_fold_last_write_wins() {
        let state = DagState::from_recovered(
            vec![
                (vec![1], vec![10]),
                (vec![2], vec![20]),
                (vec![1], vec![11]),
            ],
            Vec::new(),
            BTreeSet::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(state.latest_messages.get(&vec![1u8]), Some(&vec![11u8]));
        assert_eq!(state.latest_messages.get(&vec![2u8]), Some(&vec![20u8]));
        assert_eq!(state.latest_messages_log_size, 3);
    }
}
