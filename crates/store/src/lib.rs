//! Crash-consistent file storage for a block DAG.
//!
//! On-disk layout (paths configurable, see [`Config::in_dir`]):
//!
//! ```text
//! latest-messages.log / .crc        validator || block hash, fixed width
//! block-metadata.log  / .crc        size:i32 || metadata bytes
//! equivocations-tracker.log / .crc  validator || seq:i32 || count:i32 || hash*
//! invalid-blocks.log  / .crc        size:i32 || metadata bytes
//! block-hashes-by-deploy.log / .crc size:i32 || deploy id || block hash
//! block-number-index/               RocksDB, block hash -> block number
//! checkpoints/<start>-<end>         cold metadata, same framing as the log
//! ```
//!
//! Each `.crc` file holds the CRC32 of its log's bytes and is replaced by an
//! atomic rename after every append; that rename is the commit point. On
//! open every log is replayed and checked, and a tail damaged by a crash is
//! truncated: at most one record per log, never silently.
//!
//! One mutex serializes every mutation. Readers take a cheap
//! [`DagRepresentation`] snapshot and query it lock-free; only cold lookups
//! below the sort offset come back for the lock to load a checkpoint.

mod checkpoint;
mod crc;
mod error;
mod index;
mod log;
mod recovery;
mod representation;
mod state;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{ensure, Context, Result};
use tracing::warn;

use blockdag_core::block::{Block, BlockHash, Validator, BLOCK_HASH_LENGTH, VALIDATOR_LENGTH};
use blockdag_core::equivocation::EquivocationRecord;
use blockdag_core::metadata::BlockMetadata;

use crate::checkpoint::{load_checkpoint_dag_info, load_checkpoints, Checkpoint};
use crate::log::CrcLog;
use crate::recovery::{
    encode_deploy, encode_latest_message, encode_size_prefixed, recover_block_metadata,
    recover_deploy_index, recover_equivocations, recover_invalid_blocks,
    recover_latest_messages, squash_equivocations,
};
use crate::state::{add_to_topo, DagState};

pub use crate::checkpoint::CheckpointedDagInfo;
pub use crate::error::StoreError;
pub use crate::index::{BlockNumberIndex, IndexOptions};
pub use crate::representation::{DagRepresentation, TopoOrdering};

/// Every path and tuning value the engine reads.
#[derive(Clone, Debug)]
pub struct Config {
    pub latest_messages_log_path: PathBuf,
    pub latest_messages_crc_path: PathBuf,
    pub block_metadata_log_path: PathBuf,
    pub block_metadata_crc_path: PathBuf,
    pub equivocations_log_path: PathBuf,
    pub equivocations_crc_path: PathBuf,
    pub invalid_blocks_log_path: PathBuf,
    pub invalid_blocks_crc_path: PathBuf,
    pub block_hashes_by_deploy_log_path: PathBuf,
    pub block_hashes_by_deploy_crc_path: PathBuf,
    pub checkpoints_dir_path: PathBuf,
    pub block_number_index_path: PathBuf,
    /// Squash the latest-messages log once it holds more than
    /// `factor * |latest messages|` records.
    pub latest_messages_log_max_size_factor: usize,
    pub index_options: IndexOptions,
}

impl Config {
    /// The conventional layout, rooted at one directory.
    pub fn in_dir(base: &Path) -> Self {
        Self {
            latest_messages_log_path: base.join("latest-messages.log"),
            latest_messages_crc_path: base.join("latest-messages.crc"),
            block_metadata_log_path: base.join("block-metadata.log"),
            block_metadata_crc_path: base.join("block-metadata.crc"),
            equivocations_log_path: base.join("equivocations-tracker.log"),
            equivocations_crc_path: base.join("equivocations-tracker.crc"),
            invalid_blocks_log_path: base.join("invalid-blocks.log"),
            invalid_blocks_crc_path: base.join("invalid-blocks.crc"),
            block_hashes_by_deploy_log_path: base.join("block-hashes-by-deploy.log"),
            block_hashes_by_deploy_crc_path: base.join("block-hashes-by-deploy.crc"),
            checkpoints_dir_path: base.join("checkpoints"),
            block_number_index_path: base.join("block-number-index"),
            latest_messages_log_max_size_factor: 10,
            index_options: IndexOptions::default(),
        }
    }
}

pub(crate) struct StoreState {
    dag: DagState,
    latest_messages_log: CrcLog,
    block_metadata_log: CrcLog,
    equivocations_log: CrcLog,
    invalid_blocks_log: CrcLog,
    deploy_index_log: CrcLog,
    max_size_factor: usize,
}

impl StoreState {
    /// Rewrite the latest-messages log as a snapshot of the current map once
    /// the incremental history outgrows it.
    fn squash_latest_messages_if_needed(&mut self) -> Result<()> {
        let threshold = self.dag.latest_messages.len() * self.max_size_factor;
        if self.dag.latest_messages_log_size as usize <= threshold {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for (validator, hash) in self.dag.latest_messages.iter() {
            bytes.extend_from_slice(&encode_latest_message(validator, hash));
        }
        self.latest_messages_log.replace(&bytes)?;
        self.dag.latest_messages_log_size = 0;
        Ok(())
    }
}

pub(crate) struct StoreInner {
    lock: Mutex<StoreState>,
    index: BlockNumberIndex,
}

impl StoreInner {
    fn locked(&self) -> MutexGuard<'_, StoreState> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn info_for(checkpoint: &mut Checkpoint) -> Result<Arc<CheckpointedDagInfo>> {
        if let Some(info) = checkpoint.dag_info.upgrade() {
            return Ok(info);
        }
        let info = Arc::new(load_checkpoint_dag_info(checkpoint)?);
        checkpoint.dag_info = Arc::downgrade(&info);
        Ok(info)
    }

    /// The (weak-cached) snapshot of the checkpoint covering `block_num`.
    pub(crate) fn checkpoint_info(
        &self,
        block_num: i64,
    ) -> Result<Option<Arc<CheckpointedDagInfo>>> {
        let mut st = self.locked();
        match st
            .dag
            .checkpoints
            .iter_mut()
            .find(|c| c.start <= block_num && block_num < c.end)
        {
            Some(checkpoint) => Ok(Some(Self::info_for(checkpoint)?)),
            None => Ok(None),
        }
    }

    /// Topological rows from `start_block_number` up to (not including) the
    /// live window, assembled checkpoint by checkpoint under the lock.
    pub(crate) fn checkpoint_topo_rows(
        &self,
        start_block_number: i64,
        live_offset: i64,
    ) -> Result<Vec<Vec<BlockHash>>> {
        let mut rows = Vec::new();
        let mut st = self.locked();
        for checkpoint in st.dag.checkpoints.iter_mut() {
            if checkpoint.start >= live_offset {
                break;
            }
            if checkpoint.end <= start_block_number {
                continue;
            }
            let info = Self::info_for(checkpoint)?;
            let skip = (start_block_number - info.sort_offset).max(0) as usize;
            rows.extend(info.topo_sort.iter().skip(skip).cloned());
        }
        Ok(rows)
    }
}

/// The storage engine. Cheap to clone; all clones share one mutex-guarded
/// state.
#[derive(Clone)]
pub struct BlockDagFileStorage {
    inner: Arc<StoreInner>,
}

impl BlockDagFileStorage {
    /// Replay and validate every log, then open the append streams with
    /// their recovered CRC accumulators.
    pub fn open(config: Config) -> Result<Self> {
        for path in [
            &config.latest_messages_log_path,
            &config.block_metadata_log_path,
            &config.equivocations_log_path,
            &config.invalid_blocks_log_path,
            &config.block_hashes_by_deploy_log_path,
        ] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }

        let checkpoints = load_checkpoints(&config.checkpoints_dir_path)?;

        let latest = recover_latest_messages(
            &config.latest_messages_log_path,
            &config.latest_messages_crc_path,
        )?;
        let metadata = recover_block_metadata(
            &config.block_metadata_log_path,
            &config.block_metadata_crc_path,
        )?;
        let equivocations = recover_equivocations(
            &config.equivocations_log_path,
            &config.equivocations_crc_path,
        )?;
        let invalid = recover_invalid_blocks(
            &config.invalid_blocks_log_path,
            &config.invalid_blocks_crc_path,
        )?;
        let deploys = recover_deploy_index(
            &config.block_hashes_by_deploy_log_path,
            &config.block_hashes_by_deploy_crc_path,
        )?;

        let index =
            BlockNumberIndex::open(&config.block_number_index_path, &config.index_options)?;

        let dag = DagState::from_recovered(
            latest.records,
            metadata.records,
            squash_equivocations(equivocations.records).collect::<BTreeSet<_>>(),
            invalid.records,
            deploys.records,
            checkpoints,
        );

        let state = StoreState {
            dag,
            latest_messages_log: CrcLog::open(
                &config.latest_messages_log_path,
                &config.latest_messages_crc_path,
                latest.crc,
            )?,
            block_metadata_log: CrcLog::open(
                &config.block_metadata_log_path,
                &config.block_metadata_crc_path,
                metadata.crc,
            )?,
            equivocations_log: CrcLog::open(
                &config.equivocations_log_path,
                &config.equivocations_crc_path,
                equivocations.crc,
            )?,
            invalid_blocks_log: CrcLog::open(
                &config.invalid_blocks_log_path,
                &config.invalid_blocks_crc_path,
                invalid.crc,
            )?,
            deploy_index_log: CrcLog::open(
                &config.block_hashes_by_deploy_log_path,
                &config.block_hashes_by_deploy_crc_path,
                deploys.crc,
            )?,
            max_size_factor: config.latest_messages_log_max_size_factor,
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                lock: Mutex::new(state),
                index,
            }),
        })
    }

    fn representation_locked(&self, st: &StoreState) -> DagRepresentation {
        DagRepresentation {
            latest_messages: st.dag.latest_messages.clone(),
            child_map: st.dag.child_map.clone(),
            data_lookup: st.dag.data_lookup.clone(),
            topo_sort: st.dag.topo_sort.clone(),
            block_hashes_by_deploy: st.dag.block_hashes_by_deploy.clone(),
            invalid_blocks: st.dag.invalid_blocks.clone(),
            sort_offset: st.dag.sort_offset,
            store: self.inner.clone(),
        }
    }

    pub fn get_representation(&self) -> DagRepresentation {
        let st = self.inner.locked();
        self.representation_locked(&st)
    }

    /// Insert a validated block: update every in-memory index, record the
    /// block number, then persist the deltas log by log. A duplicate hash is
    /// a warning, not an error.
    pub fn insert(
        &self,
        block: &Block,
        genesis: &Block,
        invalid: bool,
    ) -> Result<DagRepresentation> {
        let mut st = self.inner.locked();

        if st.dag.data_lookup.contains_key(&block.block_hash) {
            warn!(
                hash = %hex::encode(&block.block_hash),
                "block is already stored, ignoring insert"
            );
            return Ok(self.representation_locked(&st));
        }

        st.squash_latest_messages_if_needed()?;

        // Reject malformed input before touching any state.
        ensure!(
            block.block_hash.len() == BLOCK_HASH_LENGTH,
            "block hash {} has {} bytes, expected {}",
            hex::encode(&block.block_hash),
            block.block_hash.len(),
            BLOCK_HASH_LENGTH
        );
        let sender_entry = match block.sender.len() {
            0 => {
                warn!(
                    hash = %hex::encode(&block.block_hash),
                    "block has an empty sender, inserting without a sender latest message"
                );
                None
            }
            n if n == VALIDATOR_LENGTH => Some((block.sender.clone(), block.block_hash.clone())),
            n => {
                return Err(StoreError::BlockSenderIsMalformed {
                    block_hash: hex::encode(&block.block_hash),
                    sender: hex::encode(&block.sender),
                    got: n,
                    expected: VALIDATOR_LENGTH,
                }
                .into())
            }
        };

        let metadata = Arc::new(BlockMetadata::from_block(block, invalid));

        if invalid {
            Arc::make_mut(&mut st.dag.invalid_blocks).insert((*metadata).clone());
        }

        Arc::make_mut(&mut st.dag.data_lookup).insert(block.block_hash.clone(), metadata.clone());

        let children = Arc::make_mut(&mut st.dag.child_map);
        for parent in &block.parents {
            children
                .entry(parent.clone())
                .or_default()
                .insert(block.block_hash.clone());
        }
        children.entry(block.block_hash.clone()).or_default();

        let sort_offset = st.dag.sort_offset;
        add_to_topo(
            Arc::make_mut(&mut st.dag.topo_sort),
            sort_offset,
            block.block_num,
            block.block_hash.clone(),
        );

        // Validators bonded but not justified are new since genesis; they
        // point at genesis until their first own block arrives.
        let justified: BTreeSet<&Validator> =
            block.justifications.iter().map(|j| &j.validator).collect();
        let mut updates: Vec<(Validator, BlockHash)> = block
            .bonds
            .iter()
            .map(|bond| &bond.validator)
            .filter(|validator| !justified.contains(*validator))
            .map(|validator| (validator.clone(), genesis.block_hash.clone()))
            .collect();
        updates.extend(sender_entry);

        let latest = Arc::make_mut(&mut st.dag.latest_messages);
        for (validator, hash) in &updates {
            latest.insert(validator.clone(), hash.clone());
        }

        self.inner.index.put(&block.block_hash, block.block_num)?;

        let by_deploy = Arc::make_mut(&mut st.dag.block_hashes_by_deploy);
        for deploy in &block.deploy_ids {
            by_deploy.insert(deploy.clone(), block.block_hash.clone());
        }

        // Persist in commit order: latest messages, metadata, invalid
        // blocks, deploys. Each append commits its CRC before the next log
        // advances, so a crash re-opens with a prefix of this sequence.
        if !updates.is_empty() {
            let mut bytes =
                Vec::with_capacity(updates.len() * (VALIDATOR_LENGTH + BLOCK_HASH_LENGTH));
            for (validator, hash) in &updates {
                bytes.extend_from_slice(&encode_latest_message(validator, hash));
            }
            st.latest_messages_log.append(&bytes)?;
            st.dag.latest_messages_log_size += updates.len() as i32;
        }

        st.block_metadata_log
            .append(&encode_size_prefixed(&metadata.to_bytes()))?;

        if invalid {
            st.invalid_blocks_log
                .append(&encode_size_prefixed(&metadata.to_bytes()))?;
        }

        if !block.deploy_ids.is_empty() {
            let mut bytes = Vec::new();
            for deploy in &block.deploy_ids {
                bytes.extend_from_slice(&encode_deploy(deploy, &block.block_hash));
            }
            st.deploy_index_log.append(&bytes)?;
        }

        Ok(self.representation_locked(&st))
    }

    /// Run `f` against the equivocations tracker, mutex held throughout.
    pub fn access_equivocations_tracker<A>(
        &self,
        f: impl FnOnce(&mut EquivocationsTracker<'_>) -> Result<A>,
    ) -> Result<A> {
        let mut st = self.inner.locked();
        f(&mut EquivocationsTracker { state: &mut st })
    }

    /// Truncate every log, reset the CRC files, drop the block-number index
    /// and zero the in-memory state.
    pub fn clear(&self) -> Result<()> {
        let mut st = self.inner.locked();
        st.latest_messages_log.reset()?;
        st.block_metadata_log.reset()?;
        st.equivocations_log.reset()?;
        st.invalid_blocks_log.reset()?;
        st.deploy_index_log.reset()?;
        self.inner.index.clear()?;
        st.dag = DagState::empty();
        Ok(())
    }

    /// Flush every stream and the index. Data files are kept.
    pub fn close(&self) -> Result<()> {
        let mut st = self.inner.locked();
        st.latest_messages_log.sync()?;
        st.block_metadata_log.sync()?;
        st.equivocations_log.sync()?;
        st.invalid_blocks_log.sync()?;
        st.deploy_index_log.sync()?;
        self.inner.index.flush()?;
        Ok(())
    }

    /// Checkpoint rotation is not performed by this engine.
    pub fn checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// Mutex-held handle to the equivocation records and their log.
pub struct EquivocationsTracker<'a> {
    state: &'a mut StoreState,
}

impl EquivocationsTracker<'_> {
    pub fn records(&self) -> &BTreeSet<EquivocationRecord> {
        &self.state.dag.equivocations_tracker
    }

    pub fn insert_equivocation_record(&mut self, record: EquivocationRecord) -> Result<()> {
        Arc::make_mut(&mut self.state.dag.equivocations_tracker).insert(record.clone());
        self.state.equivocations_log.append(&record.to_bytes())
    }

    /// Replace `record` with a revision carrying one more detected hash.
    /// The stale revision stays in the log and is collapsed on the next
    /// replay.
    pub fn update_equivocation_record(
        &mut self,
        record: EquivocationRecord,
        new_block_hash: BlockHash,
    ) -> Result<()> {
        let mut updated = record.clone();
        updated
            .equivocation_detected_block_hashes
            .insert(new_block_hash);
        let tracker = Arc::make_mut(&mut self.state.dag.equivocations_tracker);
        tracker.remove(&record);
        tracker.insert(updated.clone());
        self.state.equivocations_log.append(&updated.to_bytes())
    }
}
