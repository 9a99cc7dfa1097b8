use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::Hash;
use crate::{Result, SynnergyError};

/// Binary Merkle tree over 32-byte digests
///
/// Interior hashes are SHA-256 over the concatenated children; an odd level
/// duplicates its last node. The same tree backs both transaction roots and
/// the per-block state root over sorted `(key, post-value)` pairs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleTree {
    /// All levels, leaves first; `levels[last]` has exactly one node
    levels: Vec<Vec<Hash>>,
}

/// Inclusion proof: sibling hashes from leaf to root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleProof {
    /// Sibling hash at each level, paired with whether it sits on the right
    pub path: Vec<(Hash, bool)>,
    /// Leaf index the proof was generated for
    pub index: usize,
}

fn parent_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
}

impl MerkleTree {
    /// Build a tree from leaf digests; an empty leaf set yields an empty tree
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        if leaves.is_empty() {
            return MerkleTree { levels: Vec::new() };
        }

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left); // duplicate last odd
                next.push(parent_hash(left, right));
            }
            levels.push(next);
        }

        debug!(
            "built merkle tree: {} leaves, {} levels",
            levels[0].len(),
            levels.len()
        );
        MerkleTree { levels }
    }

    /// Root digest; `None` for an empty tree
    pub fn root(&self) -> Option<Hash> {
        self.levels.last().and_then(|l| l.first()).copied()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(|l| l.len()).unwrap_or(0)
    }

    /// Generate an inclusion proof for the leaf at `index`
    pub fn generate_proof(&self, index: usize) -> Result<MerkleProof> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return Err(SynnergyError::ValidationFailed(format!(
                "leaf index {} out of bounds ({} leaves)",
                index, leaf_count
            )));
        }

        let mut path = Vec::new();
        let mut pos = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_right = pos % 2 == 0;
            let sibling_pos = if sibling_right { pos + 1 } else { pos - 1 };
            // an odd tail pairs with itself
            let sibling = *level.get(sibling_pos).unwrap_or(&level[pos]);
            path.push((sibling, sibling_right));
            pos /= 2;
        }

        Ok(MerkleProof { path, index })
    }

    /// Verify that `leaf` sits under `root` according to `proof`
    pub fn verify_proof(root: &Hash, leaf: &Hash, proof: &MerkleProof) -> bool {
        let mut acc = *leaf;
        for (sibling, sibling_right) in &proof.path {
            acc = if *sibling_right {
                parent_hash(&acc, sibling)
            } else {
                parent_hash(sibling, &acc)
            };
        }
        acc == *root
    }
}

/// Hash one state entry into a leaf: length-prefixed key then post-value.
/// Deleted keys hash with an empty value.
fn state_leaf(key: &[u8], value: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update((key.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash(out)
}

/// State root over the changed keys of a block
///
/// Entries must be sorted by key; the root of an empty change set is the
/// zero hash so an empty block still commits to a well-defined root.
pub fn state_root(entries: &[(Vec<u8>, Vec<u8>)]) -> Hash {
    if entries.is_empty() {
        return Hash::zero();
    }
    debug_assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));
    let leaves = entries
        .iter()
        .map(|(k, v)| state_leaf(k, v))
        .collect::<Vec<_>>();
    MerkleTree::from_leaves(leaves).root().unwrap_or_else(Hash::zero)
}
