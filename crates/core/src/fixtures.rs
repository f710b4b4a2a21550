//! Deterministic block fixtures for tests across the workspace. Hashes are
//! blake3 digests of human-readable labels so failures print something
//! traceable.

use blake3;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::block::{Block, BlockHash, Bond, DeployId, Justification, Validator};

pub fn hash(label: &str) -> BlockHash {
    blake3::hash(label.as_bytes()).as_bytes().to_vec()
}

pub fn validator(label: &str) -> Validator {
    blake3::hash(format!("validator:{label}").as_bytes())
        .as_bytes()
        .to_vec()
}

pub fn deploy_id(label: &str) -> DeployId {
    format!("deploy:{label}").into_bytes()
}

fn bonds_for(validators: &[Validator]) -> Vec<Bond> {
    validators
        .iter()
        .map(|v| Bond {
            validator: v.clone(),
            stake: 10,
        })
        .collect()
}

/// Genesis: no parents, no sender, bonding the given validators.
pub fn genesis(bonded: &[Validator]) -> Block {
    Block {
        block_hash: hash("genesis"),
        parents: Vec::new(),
        justifications: Vec::new(),
        bonds: bonds_for(bonded),
        block_num: 0,
        seq_num: 0,
        sender: Vec::new(),
        deploy_ids: Vec::new(),
    }
}

/// A block on top of `parents`, numbered one past the highest parent.
/// Justifies every parent that has a sender.
pub fn child(label: &str, sender: &Validator, parents: &[&Block], bonded: &[Validator]) -> Block {
    let block_num = parents.iter().map(|p| p.block_num).max().unwrap_or(-1) + 1;
    Block {
        block_hash: hash(label),
        parents: parents.iter().map(|p| p.block_hash.clone()).collect(),
        justifications: parents
            .iter()
            .filter(|p| !p.sender.is_empty())
            .map(|p| Justification {
                validator: p.sender.clone(),
                latest_block_hash: p.block_hash.clone(),
            })
            .collect(),
        bonds: bonds_for(bonded),
        block_num,
        seq_num: block_num as i32,
        sender: sender.clone(),
        deploy_ids: Vec::new(),
    }
}

pub fn with_deploys(mut block: Block, deploys: &[DeployId]) -> Block {
    block.deploy_ids = deploys.to_vec();
    block
}

/// A random DAG in parent-before-child order: genesis first, then `n` blocks
/// each referencing one or two earlier blocks, senders cycling through
/// `validators` identities. Deterministic in `seed`.
pub fn random_dag(seed: u64, n: usize, validators: usize) -> Vec<Block> {
    let mut rng = StdRng::seed_from_u64(seed);
    let senders: Vec<Validator> = (0..validators.max(1))
        .map(|i| validator(&format!("dag-{seed}-{i}")))
        .collect();
    let mut blocks = vec![genesis(&senders)];
    for i in 0..n {
        let first = rng.gen_range(0..blocks.len());
        let mut parents = vec![first];
        if blocks.len() > 1 && rng.gen_bool(0.4) {
            let second = rng.gen_range(0..blocks.len());
            if second != first {
                parents.push(second);
            }
        }
        let parent_refs: Vec<&Block> = parents.iter().map(|&p| &blocks[p]).collect();
        let sender = senders[i % senders.len()].clone();
        let block = child(&format!("dag-{seed}-block-{i}"), &sender, &parent_refs, &senders);
        blocks.push(block);
    }
    blocks
}
