//! Checking the prover's answers against the seeds and the commitments.
use std::collections::BTreeMap;

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use super::{Cell, GpuFailure, GpuId, GpuVerdict, SeedPair};
use crate::{
    config::AttestConfig,
    matrix::{product_cell, SeededMatrix},
    merkle::{row_from_bytes, verify_proof, Digest, Hasher},
    remote::{CellResponse, GpuResponse},
};

/// `|got - expected| <= atol + rtol * |expected|`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { atol: 1e-5, rtol: 1e-5 }
    }
}

impl From<&AttestConfig> for Tolerance {
    fn from(cfg: &AttestConfig) -> Self {
        Self {
            atol: cfg.atol,
            rtol: cfg.rtol,
        }
    }
}

impl Tolerance {
    pub fn is_close(&self, got: f32, expected: f32) -> bool {
        let (got, expected) = (got as f64, expected as f64);
        got.is_finite() && expected.is_finite() && (got - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Verify a single answered cell.
///
/// The value is checked against the product recomputed from the seeds,
/// then the row against the committed root.
pub fn verify_cell<H: Hasher>(
    a: &SeededMatrix,
    b: &SeededMatrix,
    root: &Digest,
    answer: &CellResponse,
    tolerance: &Tolerance,
) -> GpuVerdict {
    let n = a.n();
    let (i, j) = (answer.i, answer.j);
    if i >= n || j >= n {
        return Err(GpuFailure::Malformed(format!("cell ({i}, {j}) outside of {n}x{n}")));
    }
    let row = row_from_bytes(&answer.row)
        .ok_or_else(|| GpuFailure::Malformed(format!("row {i} is not a sequence of f32")))?;
    if row.len() != n {
        return Err(GpuFailure::Malformed(format!(
            "row {i} has {} values, expected {n}",
            row.len()
        )));
    }

    let expected = product_cell(a, b, i, j);
    if !tolerance.is_close(answer.value, expected) {
        return Err(GpuFailure::ValueMismatch {
            i,
            j,
            expected,
            got: answer.value,
        });
    }
    if !tolerance.is_close(row[j], answer.value) {
        return Err(GpuFailure::ValueMismatch {
            i,
            j,
            expected: answer.value,
            got: row[j],
        });
    }
    if !verify_proof::<H>(&answer.row, &answer.proof, root, i) {
        return Err(GpuFailure::InvalidMerkleProof { row: i });
    }
    Ok(())
}

/// Verify every challenged cell of one GPU. Stops at the first failure.
pub fn verify_gpu<H: Hasher>(
    seeds: &SeedPair,
    n: usize,
    root: &Digest,
    challenged: &[Cell],
    response: Option<&GpuResponse>,
    tolerance: &Tolerance,
) -> GpuVerdict {
    let response = response.ok_or(GpuFailure::NoResponse)?;
    let (a, b) = seeds.matrices(n);
    for cell in challenged {
        let answer = response
            .cells
            .iter()
            .find(|c| c.i == cell.i && c.j == cell.j)
            .ok_or_else(|| GpuFailure::Malformed(format!("no answer for cell ({}, {})", cell.i, cell.j)))?;
        verify_cell::<H>(&a, &b, root, answer, tolerance)?;
    }
    Ok(())
}

/// Everything needed to verify one GPU.
pub struct GpuCase<'a> {
    pub seeds: SeedPair,
    pub root: Option<Digest>,
    pub challenged: &'a [Cell],
    pub response: Option<&'a GpuResponse>,
}

/// Verify all GPUs of a miner in parallel.
pub fn verify_all<H: Hasher>(
    n: usize,
    cases: &BTreeMap<GpuId, GpuCase<'_>>,
    tolerance: &Tolerance,
) -> BTreeMap<GpuId, GpuVerdict> {
    cases
        .par_iter()
        .map(|(gpu, case)| {
            let verdict = match &case.root {
                None => Err(GpuFailure::NoCommitment),
                Some(root) => verify_gpu::<H>(&case.seeds, n, root, case.challenged, case.response, tolerance),
            };
            if let Err(failure) = &verdict {
                log::debug!("gpu {gpu} failed verification: {failure}");
            }
            (*gpu, verdict)
        })
        .collect()
}
