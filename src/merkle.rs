//! Merkle commitment over the rows of the product matrix.
//!
//! Leaves are digests of the row bytes (little-endian `f32`s). Levels with an
//! odd number of nodes duplicate their last node, so every node has a sibling.
use std::marker::PhantomData;

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

pub type Digest = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("cannot build a merkle tree without leaves")]
    Empty,
    #[error("leaf index {index} out of range (tree has {leaves} leaves)")]
    IndexOutOfRange { index: usize, leaves: usize },
}

/// Digest function used for leaves and internal nodes.
pub trait Hasher {
    fn hash(data: &[u8]) -> Digest;

    fn hash_pair(left: &Digest, right: &Digest) -> Digest {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(left);
        data[32..].copy_from_slice(right);
        Self::hash(&data)
    }
}

/// SHA-256, as used by the prover-side script.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256;

impl Hasher for Sha256 {
    fn hash(data: &[u8]) -> Digest {
        use sha2::Digest as _;
        sha2::Sha256::digest(data).into()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3;

impl Hasher for Blake3 {
    fn hash(data: &[u8]) -> Digest {
        blake3::hash(data).into()
    }
}

/// Serialize a matrix row the way it is committed to.
pub fn row_bytes(row: &[f32]) -> Vec<u8> {
    row.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [row_bytes]. Returns `None` if the length is not a multiple of 4.
pub fn row_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[derive(Debug, Clone)]
pub struct MerkleTree<H = Sha256> {
    // levels[0] are the leaves, the last level holds the root
    levels: Vec<Vec<Digest>>,
    _hasher: PhantomData<H>,
}

impl<H: Hasher> MerkleTree<H> {
    /// Build the tree. Leaves are hashed in parallel.
    pub fn build<R>(rows: &[R]) -> Result<Self, Error>
    where
        R: AsRef<[u8]> + Sync,
    {
        if rows.is_empty() {
            return Err(Error::Empty);
        }
        let leaves: Vec<Digest> = rows.par_iter().map(|row| H::hash(row.as_ref())).collect();
        Ok(Self::from_leaves(leaves))
    }

    pub fn from_leaves(leaves: Vec<Digest>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let level = &levels[levels.len() - 1];
            let next = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => H::hash_pair(left, right),
                    [last] => H::hash_pair(last, last),
                    _ => unreachable!("chunks(2) yields 1 or 2 items"),
                })
                .collect();
            levels.push(next);
        }
        Self {
            levels,
            _hasher: PhantomData,
        }
    }

    pub fn root(&self) -> Digest {
        // `levels` is never empty and the top level has exactly one node
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaves(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling hashes from the leaf at `index` up to (excluding) the root.
    pub fn proof(&self, mut index: usize) -> Result<Vec<Digest>, Error> {
        if index >= self.leaves() {
            return Err(Error::IndexOutOfRange {
                index,
                leaves: self.leaves(),
            });
        }
        let mut proof = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = level.get(index ^ 1).unwrap_or(&level[index]);
            proof.push(*sibling);
            index /= 2;
        }
        Ok(proof)
    }
}

/// Check that `row` is the leaf at `index` of the tree committed to by `root`.
pub fn verify_proof<H: Hasher>(row: &[u8], proof: &[Digest], root: &Digest, index: usize) -> bool {
    let mut index = index;
    let mut current = H::hash(row);
    for sibling in proof {
        current = if index % 2 == 0 {
            H::hash_pair(&current, sibling)
        } else {
            H::hash_pair(sibling, &current)
        };
        index /= 2;
    }
    // a proof that is too short leaves a non-zero index behind
    index == 0 && &current == root
}
