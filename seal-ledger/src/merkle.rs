//! Merkle tree for inclusion proofs
//!
//! # Design
//!
//! - Binary tree over lowercase hex leaf hashes
//! - A pair hashes as `sha256_hex(left_hex ++ right_hex)`, the concatenated
//!   hex text, not the raw digests. Historical blocks depend on this.
//! - Odd node at any level is paired with itself
//! - Empty tree root is `sha256("EMPTY_BLOCK")`, a single leaf is its own root

use serde::{Deserialize, Serialize};

use crate::canonical::{empty_block_hash, sha256_hex};
use crate::error::{Error, Result};

/// Hash a pair of hex hashes (used for internal nodes)
pub fn hash_pair(left: &str, right: &str) -> String {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    sha256_hex(&joined)
}

/// Side on which a sibling sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// One level of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Side of the sibling
    pub position: Position,
    /// Sibling hash
    pub hash: String,
}

/// Merkle proof (path from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    /// Index of the proven leaf
    pub leaf_index: usize,
    /// Leaf hash being proven
    pub leaf_hash: String,
    /// Root the proof leads to
    pub merkle_root: String,
    /// Siblings from leaf level upwards
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Verify proof against its own root
    pub fn verify(&self) -> bool {
        verify_proof(&self.leaf_hash, &self.steps, &self.merkle_root)
    }
}

/// Fold `steps` over `leaf_hash` and compare with `expected_root`
pub fn verify_proof(leaf_hash: &str, steps: &[ProofStep], expected_root: &str) -> bool {
    let mut current = leaf_hash.to_string();
    for step in steps {
        current = match step.position {
            Position::Left => hash_pair(&step.hash, &current),
            Position::Right => hash_pair(&current, &step.hash),
        };
    }
    current == expected_root
}

fn next_level(level: &[String]) -> Vec<String> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [only] => hash_pair(only, only),
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

/// Merkle root of `leaves`
pub fn merkle_root(leaves: &[String]) -> String {
    match leaves {
        [] => empty_block_hash(),
        [single] => single.clone(),
        _ => {
            let mut level = next_level(leaves);
            while level.len() > 1 {
                level = next_level(&level);
            }
            level.swap_remove(0)
        }
    }
}

/// Inclusion proof for the leaf at `leaf_index`
pub fn build_proof(leaves: &[String], leaf_index: usize) -> Result<MerkleProof> {
    if leaf_index >= leaves.len() {
        return Err(Error::Validation("Invalid leaf index".to_string()));
    }

    let mut steps = Vec::new();
    let mut level = leaves.to_vec();
    let mut index = leaf_index;

    while level.len() > 1 {
        let is_right = index % 2 == 1;
        let step = if is_right {
            ProofStep {
                position: Position::Left,
                hash: level[index - 1].clone(),
            }
        } else {
            // No sibling on an odd level, pair with self
            let sibling = level.get(index + 1).unwrap_or(&level[index]);
            ProofStep {
                position: Position::Right,
                hash: sibling.clone(),
            }
        };
        steps.push(step);
        level = next_level(&level);
        index /= 2;
    }

    Ok(MerkleProof {
        leaf_index,
        leaf_hash: leaves[leaf_index].clone(),
        merkle_root: level.swap_remove(0),
        steps,
    })
}
