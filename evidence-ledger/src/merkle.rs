//! Merkle tree for cryptographic proofs
//!
//! # Design
//!
//! - Binary Merkle tree with SHA-256 hashing
//! - Built bottom-up, pairwise, in leaf ordinal order
//! - A lone node at the end of a level is paired with itself,
//!   both when building and when verifying
//! - A single leaf is its own root; an empty tree has the zero root

use crate::crypto::hash_pair;
use crate::types::{Digest, Proof, ProofStep, Side};

/// Fully materialized Merkle tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] = leaf hashes, last level = [root]
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build tree from leaf hashes in ordinal order
    pub fn build(leaves: &[Digest]) -> Self {
        let mut levels = vec![leaves.to_vec()];

        while levels.last().map_or(false, |level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next = next_level(current);
            levels.push(next);
        }

        Self { levels }
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Levels above the leaves
    pub fn height(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Merkle root
    pub fn root(&self) -> Digest {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => *root,
            None => Digest::ZERO,
        }
    }

    /// Sibling path from leaf to root
    pub fn path(&self, leaf_index: usize) -> Option<Vec<ProofStep>> {
        if leaf_index >= self.len() {
            return None;
        }

        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut index = leaf_index;

        // Every level except the root contributes one sibling
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if index % 2 == 0 {
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofStep {
                    hash: *sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    hash: level[index - 1],
                    side: Side::Left,
                }
            };

            path.push(step);
            index /= 2;
        }

        Some(path)
    }
}

/// Pairwise-combine one level into its parent level
fn next_level(level: &[Digest]) -> Vec<Digest> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [lone] => hash_pair(lone, lone),
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

/// Compute Merkle root from leaf hashes
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return Digest::ZERO;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_level(&current);
    }
    current[0]
}

/// Levels above the leaves for a tree of `leaf_count` leaves
pub fn tree_height(leaf_count: u64) -> u32 {
    if leaf_count <= 1 {
        return 0;
    }
    64 - (leaf_count - 1).leading_zeros()
}

/// Recompute the root implied by a leaf hash and a sibling path
pub fn root_from_path(leaf_hash: &Digest, path: &[ProofStep]) -> Digest {
    path.iter().fold(*leaf_hash, |running, step| match step.side {
        Side::Left => hash_pair(&step.hash, &running),
        Side::Right => hash_pair(&running, &step.hash),
    })
}

/// Verify a proof against the root pinned at generation time
pub fn verify_proof(leaf_hash: &Digest, proof: &Proof) -> bool {
    root_from_path(leaf_hash, &proof.path) == proof.root_at_generation
}
