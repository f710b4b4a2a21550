//! Block types as handed to the storage engine. Validation (parent checks,
//! signatures, stake accounting) happens upstream; the engine only cares
//! about hashes, numbers and the bond/justification lists.

use serde::{Deserialize, Serialize};

/// Opaque block hash bytes; well-formed hashes are [`BLOCK_HASH_LENGTH`] long.
pub type BlockHash = Vec<u8>;
/// Opaque validator identity bytes; well-formed ids are [`VALIDATOR_LENGTH`] long.
pub type Validator = Vec<u8>;
/// Deploy signature bytes, variable width.
pub type DeployId = Vec<u8>;

pub const BLOCK_HASH_LENGTH: usize = 32;
pub const VALIDATOR_LENGTH: usize = 32;

/// The creator's view of another validator's latest block at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Justification {
    pub validator: Validator,
    pub latest_block_hash: BlockHash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bond {
    pub validator: Validator,
    pub stake: i64,
}

/// A validated block. The genesis block has an empty `sender` and no parents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub block_hash: BlockHash,
    pub parents: Vec<BlockHash>,
    pub justifications: Vec<Justification>,
    pub bonds: Vec<Bond>,
    pub block_num: i64,
    pub seq_num: i32,
    pub sender: Validator,
    /// Signatures of the deploys included in this block.
    pub deploy_ids: Vec<DeployId>,
}
