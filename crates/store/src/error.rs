//! Storage-engine error taxonomy. Raised through `anyhow` so call sites can
//! attach file context; callers and tests match variants via
//! `err.downcast_ref::<StoreError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Latest-messages log failed CRC validation beyond single-record repair.
    #[error("latest messages log {path} is malformed")]
    LatestMessagesLogIsMalformed { path: PathBuf },

    /// Latest-messages log record structure is unreadable.
    #[error("latest messages log {path} is corrupted")]
    LatestMessagesLogIsCorrupted { path: PathBuf },

    #[error("block metadata store {path} is corrupted")]
    DataLookupIsCorrupted { path: PathBuf },

    #[error("equivocations tracker log {path} is malformed")]
    EquivocationsTrackerLogIsMalformed { path: PathBuf },

    #[error("invalid blocks log {path} is corrupted")]
    InvalidBlocksIsCorrupted { path: PathBuf },

    #[error("block hashes by deploy log {path} is corrupted")]
    BlockHashesByDeployLogIsCorrupted { path: PathBuf },

    #[error("checkpoints do not start from zero: {paths:?}")]
    CheckpointsDoNotStartFromZero { paths: Vec<PathBuf> },

    #[error("checkpoints are not consecutive: {paths:?}")]
    CheckpointsAreNotConsecutive { paths: Vec<PathBuf> },

    #[error("topological sort of length {length} does not fit in a 32-bit index")]
    TopoSortLengthIsTooBig { length: u64 },

    #[error("sender of block {block_hash} is malformed: {sender} ({got} bytes, expected 0 or {expected})")]
    BlockSenderIsMalformed {
        /// Hex-encoded block hash.
        block_hash: String,
        /// Hex-encoded sender bytes.
        sender: String,
        got: usize,
        expected: usize,
    },
}
