//! Fixed-depth binary Merkle trees over keccak-256.
//!
//! Two trees share this code: the on-chain commitment pool (depth 24) and
//! the sequencer inclusion tree over authorization leaves (depth 32). Levels
//! are built left-to-right; a level with an odd node count duplicates its
//! last node. Proof verification alternates hash ordering by the parity of
//! the index, shifted once per level.

use alloy_primitives::{B256, Keccak256};

/// Depth of the on-chain commitment pool tree.
pub const POOL_TREE_DEPTH: usize = 24;
/// Depth of the sequencer inclusion tree.
pub const SEQUENCER_TREE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("leaf index {index} out of range for {len} leaves")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("{0} leaves exceed a depth-{1} tree")]
    TooManyLeaves(usize, usize),
}

fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize()
}

fn level_up(nodes: &mut Vec<B256>) {
    if nodes.len() % 2 == 1 {
        let last = *nodes.last().expect("level is non-empty");
        nodes.push(last);
    }
    let mut next = Vec::with_capacity(nodes.len() / 2);
    for pair in nodes.chunks_exact(2) {
        next.push(hash_pair(&pair[0], &pair[1]));
    }
    *nodes = next;
}

/// Computes the root of a depth-`depth` tree over `leaves`.
///
/// An empty leaf set hashes as a single zero leaf; a level that has
/// collapsed to one node is the root.
pub fn build_root(leaves: &[B256], depth: usize) -> Result<B256, MerkleError> {
    if leaves.len() > 1usize << depth.min(63) {
        return Err(MerkleError::TooManyLeaves(leaves.len(), depth));
    }
    let mut nodes = if leaves.is_empty() {
        vec![B256::ZERO]
    } else {
        leaves.to_vec()
    };
    for _ in 0..depth {
        if nodes.len() == 1 {
            break;
        }
        level_up(&mut nodes);
    }
    Ok(nodes[0])
}

/// Builds the sibling path for `leaves[index]`.
///
/// The proof stops once the level collapses to a single node, so its length
/// is `ceil(log2(len))` rather than the full fixed depth; [`verify_proof`]
/// accepts either form.
pub fn build_proof(leaves: &[B256], index: usize, depth: usize) -> Result<Vec<B256>, MerkleError> {
    if index >= leaves.len() {
        return Err(MerkleError::IndexOutOfRange {
            index,
            len: leaves.len(),
        });
    }
    if leaves.len() > 1usize << depth.min(63) {
        return Err(MerkleError::TooManyLeaves(leaves.len(), depth));
    }
    let mut nodes = leaves.to_vec();
    let mut proof = Vec::new();
    let mut position = index;
    for _ in 0..depth {
        if nodes.len() == 1 {
            break;
        }
        if nodes.len() % 2 == 1 {
            let last = *nodes.last().expect("level is non-empty");
            nodes.push(last);
        }
        let sibling = position ^ 1;
        proof.push(nodes[sibling]);
        position >>= 1;
        let mut next = Vec::with_capacity(nodes.len() / 2);
        for pair in nodes.chunks_exact(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        nodes = next;
    }
    Ok(proof)
}

/// Verifies a sibling path against a root.
///
/// At each level the current node hashes left or right of its sibling
/// depending on the bit of `index` at that level.
pub fn verify_proof(leaf: &B256, index: usize, proof: &[B256], root: &B256) -> bool {
    let mut current = *leaf;
    for (level, sibling) in proof.iter().enumerate() {
        current = if (index >> level) & 1 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
    }
    current == *root
}
