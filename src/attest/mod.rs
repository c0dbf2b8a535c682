//! GPU attestation.
//!
//! A commit-then-challenge protocol over a matrix product: the prover commits
//! to every row of `C = A·B` with a Merkle root per GPU before learning which
//! cells the verifier will check. See [protocol] for the flow.
use std::collections::{BTreeMap, BTreeSet};

use rand::{CryptoRng, Rng, RngCore};
use thiserror::Error;

use crate::{matrix::SeededMatrix, outcome::Outcome};

pub mod identity;
pub mod protocol;
pub mod prover;
pub mod quorum;
pub mod verifier;

pub use protocol::Attestor;

pub type GpuId = u32;

/// Seeds of the `A` and `B` matrices of one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPair {
    pub a: u64,
    pub b: u64,
}

impl SeedPair {
    pub fn random<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Result<Self, rand::Error> {
        let (mut a, mut b) = ([0u8; 8], [0u8; 8]);
        rng.try_fill_bytes(&mut a)?;
        rng.try_fill_bytes(&mut b)?;
        Ok(Self {
            a: u64::from_le_bytes(a),
            b: u64::from_le_bytes(b),
        })
    }

    pub fn matrices(&self, n: usize) -> (SeededMatrix, SeededMatrix) {
        (SeededMatrix::new(self.a, n), SeededMatrix::new(self.b, n))
    }
}

/// A cell `(i, j)` of the product matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub i: usize,
    pub j: usize,
}

/// Sample `count` distinct cells of an `n x n` matrix.
pub fn sample_cells<R: Rng + CryptoRng + ?Sized>(rng: &mut R, n: usize, count: usize) -> Vec<Cell> {
    let count = count.min(n.saturating_mul(n));
    let mut cells = BTreeSet::new();
    while cells.len() < count {
        cells.insert(Cell {
            i: rng.gen_range(0..n),
            j: rng.gen_range(0..n),
        });
    }
    cells.into_iter().collect()
}

/// Why a GPU failed verification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuFailure {
    #[error("no commitment received")]
    NoCommitment,
    #[error("no response received")]
    NoResponse,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("value mismatch at ({i}, {j}): expected {expected}, got {got}")]
    ValueMismatch { i: usize, j: usize, expected: f32, got: f32 },
    #[error("invalid merkle proof for row {row}")]
    InvalidMerkleProof { row: usize },
}

impl GpuFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            GpuFailure::NoCommitment => "no_commitment",
            GpuFailure::NoResponse => "no_response",
            GpuFailure::Malformed(_) => "malformed",
            GpuFailure::ValueMismatch { .. } => "value_mismatch",
            GpuFailure::InvalidMerkleProof { .. } => "invalid_merkle_proof",
        }
    }
}

pub type GpuVerdict = Result<(), GpuFailure>;

/// Errors that abort an attestation instead of failing the miner.
#[derive(Error, Debug)]
pub enum AttestError {
    #[error("randomness unavailable: {0}")]
    Randomness(#[from] rand::Error),
    #[error("setting up attestation: {0}")]
    Setup(String),
}

/// Result of attesting one miner.
#[derive(Debug, Clone)]
pub struct Attestation {
    pub num_gpus: u32,
    pub matrix_size: usize,
    pub identified_gpu: Option<String>,
    pub per_gpu: BTreeMap<GpuId, GpuVerdict>,
    pub overall_pass: bool,
    pub outcome: Outcome,
}

impl Attestation {
    pub fn failed(outcome: Outcome) -> Self {
        Self {
            num_gpus: 0,
            matrix_size: 0,
            identified_gpu: None,
            per_gpu: BTreeMap::new(),
            overall_pass: false,
            outcome,
        }
    }

    pub fn passed_gpus(&self) -> usize {
        self.per_gpu.values().filter(|v| v.is_ok()).count()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn sampled_cells_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(9);
        let cells = sample_cells(&mut rng, 4, 10);
        assert_eq!(10, cells.len());
        assert!(cells.iter().all(|c| c.i < 4 && c.j < 4));
        // asking for more cells than the matrix has returns all of them
        assert_eq!(4, sample_cells(&mut rng, 2, 100).len());
        assert!(sample_cells(&mut rng, 0, 5).is_empty());
    }

    #[test]
    fn seed_pairs_differ() {
        let mut rng = StdRng::seed_from_u64(1);
        let first = SeedPair::random(&mut rng).unwrap();
        let second = SeedPair::random(&mut rng).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn failure_kinds() {
        assert_eq!("invalid_merkle_proof", GpuFailure::InvalidMerkleProof { row: 1 }.kind());
        assert_eq!(
            "value_mismatch",
            GpuFailure::ValueMismatch {
                i: 0,
                j: 0,
                expected: 1.0,
                got: 2.0
            }
            .kind()
        );
    }
}
