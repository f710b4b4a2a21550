//! Per-block record kept by the storage engine. Round-trips through CBOR;
//! serde_cbor's struct encoding is byte-for-byte deterministic for these
//! types, which the on-disk CRC pairing relies on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHash, Bond, Justification, Validator};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockMetadata {
    pub block_hash: BlockHash,
    pub parents: Vec<BlockHash>,
    pub block_num: i64,
    pub seq_num: i32,
    pub sender: Validator,
    pub justifications: Vec<Justification>,
    pub bonds: Vec<Bond>,
    pub invalid: bool,
}

impl BlockMetadata {
    pub fn from_block(block: &Block, invalid: bool) -> Self {
        Self {
            block_hash: block.block_hash.clone(),
            parents: block.parents.clone(),
            block_num: block.block_num,
            seq_num: block.seq_num,
            sender: block.sender.clone(),
            justifications: block.justifications.clone(),
            bonds: block.bonds.clone(),
            invalid,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_cbor::to_vec(self).expect("CBOR serialize BlockMetadata")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(bytes).context("decode BlockMetadata CBOR")
    }
}
