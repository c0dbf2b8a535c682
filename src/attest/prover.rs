//! Reference prover.
//!
//! Computes the full products on the CPU. It is what `pog-prover` runs when no
//! accelerator is available, and it answers challenges in tests.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use rayon::prelude::{IndexedParallelIterator, ParallelIterator, ParallelSliceMut};

use super::{GpuId, SeedPair};
use crate::{
    matrix::{dot, SeededMatrix, Strategy},
    merkle::{self, row_bytes, Hasher, MerkleTree, Sha256},
    remote::{BenchmarkReport, CellResponse, CommitReport, GpuResponse, IndicesFile, ProofResponses, SeedsFile},
};

fn for_each_row(strategy: Strategy, data: &mut [f32], n: usize, f: impl Fn(usize, &mut [f32]) + Sync + Send) {
    match strategy {
        Strategy::Scalar => data.chunks_mut(n).enumerate().for_each(|(i, row)| f(i, row)),
        Strategy::Parallel { .. } => strategy.install(|| {
            data.par_chunks_mut(n).enumerate().for_each(|(i, row)| f(i, row));
        }),
    }
}

/// `C = A·B` in row-major order.
///
/// Cells are accumulated with [dot], in the same order the verifier uses.
pub fn multiply(a: &SeededMatrix, b: &SeededMatrix, strategy: Strategy) -> Vec<f32> {
    let n = a.n();
    if n == 0 {
        return Vec::new();
    }
    let a = a.materialize(strategy);
    let mut bt = vec![0f32; n * n];
    for_each_row(strategy, &mut bt, n, |j, col| {
        for (k, v) in col.iter_mut().enumerate() {
            *v = b.get(k, j);
        }
    });

    let mut c = vec![0f32; n * n];
    for_each_row(strategy, &mut c, n, |i, row| {
        let a_row = &a[i * n..(i + 1) * n];
        for (j, v) in row.iter_mut().enumerate() {
            *v = dot(a_row, &bt[j * n..(j + 1) * n]);
        }
    });
    c
}

struct GpuCommitment<H> {
    product: Vec<f32>,
    tree: MerkleTree<H>,
    elapsed: Duration,
}

/// Products and Merkle trees of all GPUs.
pub struct Commitment<H = Sha256> {
    n: usize,
    gpus: BTreeMap<GpuId, GpuCommitment<H>>,
}

impl<H: Hasher> Commitment<H> {
    pub fn compute(seeds: &SeedsFile, strategy: Strategy) -> Result<Self, merkle::Error> {
        let n = seeds.n;
        let mut gpus = BTreeMap::new();
        for (gpu, pair) in &seeds.seeds {
            let start = Instant::now();
            let (a, b) = pair.matrices(n);
            let product = multiply(&a, &b, strategy);
            let rows: Vec<Vec<u8>> = product.chunks(n.max(1)).map(row_bytes).collect();
            let tree = MerkleTree::build(&rows)?;
            let elapsed = start.elapsed();
            log::debug!("gpu {gpu}: committed to {n}x{n} product in {elapsed:?}");
            gpus.insert(*gpu, GpuCommitment { product, tree, elapsed });
        }
        Ok(Self { n, gpus })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn root(&self, gpu: GpuId) -> Option<merkle::Digest> {
        self.gpus.get(&gpu).map(|c| c.tree.root())
    }

    pub fn report(&self) -> CommitReport {
        CommitReport {
            roots: self.gpus.iter().map(|(gpu, c)| (*gpu, c.tree.root())).collect(),
            timings: self
                .gpus
                .iter()
                .map(|(gpu, c)| (*gpu, c.elapsed.as_secs_f64()))
                .collect(),
        }
    }

    /// Answer the challenged cells. Cells of unknown GPUs are skipped.
    pub fn respond(&self, indices: &IndicesFile) -> Result<ProofResponses, merkle::Error> {
        let n = self.n;
        let mut responses = ProofResponses::new();
        for (gpu, cells) in &indices.cells {
            let Some(commitment) = self.gpus.get(gpu) else {
                log::warn!("no commitment for gpu {gpu}");
                continue;
            };
            let mut answers = Vec::with_capacity(cells.len());
            for cell in cells {
                if cell.j >= n {
                    return Err(merkle::Error::IndexOutOfRange { index: cell.j, leaves: n });
                }
                let proof = commitment.tree.proof(cell.i)?;
                let row = &commitment.product[cell.i * n..(cell.i + 1) * n];
                answers.push(CellResponse {
                    i: cell.i,
                    j: cell.j,
                    value: row[cell.j],
                    row: row_bytes(row),
                    proof,
                });
            }
            responses.insert(*gpu, GpuResponse { cells: answers });
        }
        Ok(responses)
    }
}

/// Time one multiplication of size `n` per precision.
///
/// The CPU path has no half precision, both figures come from `f32` runs.
pub fn benchmark(n: usize, num_gpus: u32, vram_bytes: u64, strategy: Strategy) -> BenchmarkReport {
    let time = |seeds: SeedPair| {
        let (a, b) = seeds.matrices(n);
        let start = Instant::now();
        let c = multiply(&a, &b, strategy);
        std::hint::black_box(c);
        start.elapsed().as_secs_f64().max(f64::MIN_POSITIVE)
    };
    let time_fp16 = time(SeedPair { a: 1, b: 2 });
    let time_fp32 = time(SeedPair { a: 3, b: 4 });
    BenchmarkReport {
        num_gpus,
        vram_bytes,
        size_fp16: n,
        time_fp16,
        size_fp32: n,
        time_fp32,
    }
}
