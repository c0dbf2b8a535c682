//! Seeded matrix generation.
//!
//! Every entry of the challenge matrices is a pure function of `(seed, row, col)`.
//! The prover has to materialize both operands and the whole product `C = A·B`,
//! while the verifier only recomputes the handful of cells it challenges,
//! each in `O(n)`.
//!
//! # generator
//! The 32-bit state is `seed + (row mod 2^32) + col` (wrapping), scrambled with
//! 10 rounds of xorshift32 and normalized by `0xFFFFFFFF`.
//! The scalar and the parallel paths share [prng_value] so they are bit-identical.
use rayon::prelude::{IndexedParallelIterator, ParallelIterator, ParallelSliceMut};
use thiserror::Error;

pub const XORSHIFT_ROUNDS: usize = 10;
/// Matrix sizes are aligned to this block for hardware efficiency.
pub const BLOCK_ALIGNMENT: usize = 32;

const NORMALIZER: f64 = 0xFFFF_FFFFu32 as f64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    #[error("matrix size {n} is below the minimum of {min}")]
    Undersized { n: usize, min: usize },
    #[error("matrix size {n} is not a multiple of {BLOCK_ALIGNMENT}")]
    Unaligned { n: usize },
}

#[inline(always)]
pub fn xorshift32(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Pseudo-random value in `[0, 1]` of cell `(row, col)` of the matrix seeded with `seed`.
#[inline]
pub fn prng_value(seed: u64, row: u64, col: u64) -> f32 {
    let row = row & 0xFFFF_FFFF;
    let mut state = seed.wrapping_add(row).wrapping_add(col) as u32;
    for _ in 0..XORSHIFT_ROUNDS {
        state = xorshift32(state);
    }
    (state as f64 / NORMALIZER) as f32
}

/// Dot product accumulated in `f64`, in index order.
///
/// Both the prover reference implementation and the verifier go through
/// this function, so honest results are bit-identical.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .fold(0f64, |acc, (&x, &y)| acc + x as f64 * y as f64) as f32
}

/// How to materialize matrices. Selected once, up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Scalar,
    Parallel { threads: usize },
}

impl Strategy {
    pub fn detect() -> Self {
        match std::thread::available_parallelism() {
            Ok(threads) if threads.get() > 1 => Strategy::Parallel {
                threads: threads.get(),
            },
            _ => Strategy::Scalar,
        }
    }

    /// Run `f` with this strategy's rayon pool installed (if any).
    pub(crate) fn install<T: Send>(&self, f: impl FnOnce() -> T + Send) -> T {
        match self {
            Strategy::Scalar => f(),
            Strategy::Parallel { threads } => match rayon::ThreadPoolBuilder::new()
                .num_threads(*threads)
                .build()
            {
                Ok(pool) => pool.install(f),
                Err(e) => {
                    log::warn!("cannot build thread pool ({e}), using the global one");
                    f()
                }
            },
        }
    }
}

/// A logical `n x n` matrix defined by its seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededMatrix {
    seed: u64,
    n: usize,
}

impl SeededMatrix {
    pub fn new(seed: u64, n: usize) -> Self {
        Self { seed, n }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        debug_assert!(row < self.n && col < self.n);
        prng_value(self.seed, row as u64, col as u64)
    }

    pub fn row(&self, row: usize) -> Vec<f32> {
        (0..self.n).map(|col| self.get(row, col)).collect()
    }

    pub fn col(&self, col: usize) -> Vec<f32> {
        (0..self.n).map(|row| self.get(row, col)).collect()
    }

    /// Materialize the whole matrix in row-major order.
    pub fn materialize(&self, strategy: Strategy) -> Vec<f32> {
        let mut data = vec![0f32; self.n * self.n];
        if self.n == 0 {
            return data;
        }
        let fill_row = |(row, out): (usize, &mut [f32])| {
            for (col, v) in out.iter_mut().enumerate() {
                *v = self.get(row, col);
            }
        };
        match strategy {
            Strategy::Scalar => data.chunks_mut(self.n).enumerate().for_each(fill_row),
            Strategy::Parallel { .. } => strategy.install(|| {
                data.par_chunks_mut(self.n).enumerate().for_each(fill_row);
            }),
        }
        data
    }
}

/// Value of `C[i, j]` where `C = A·B`, recomputed from the seeds alone.
pub fn product_cell(a: &SeededMatrix, b: &SeededMatrix, i: usize, j: usize) -> f32 {
    dot(&a.row(i), &b.col(j))
}

/// Largest matrix size whose operands fit in `vram_gb` of memory,
/// aligned down to [BLOCK_ALIGNMENT].
pub fn adjust_matrix_size(vram_gb: f64, element_size: usize, buffer_factor: f64) -> usize {
    if !vram_gb.is_finite() || vram_gb <= 0.0 || element_size == 0 {
        return 0;
    }
    let usable = vram_gb * buffer_factor * 1e9;
    let max_size = (usable / (2 * element_size) as f64).sqrt() as usize;
    (max_size / BLOCK_ALIGNMENT) * BLOCK_ALIGNMENT
}

/// Reject sizes too small for a meaningful attestation or not block aligned.
pub fn check_size(n: usize, min: usize) -> Result<usize, SizeError> {
    if n < min || n == 0 {
        return Err(SizeError::Undersized { n, min });
    }
    if n % BLOCK_ALIGNMENT != 0 {
        return Err(SizeError::Unaligned { n });
    }
    Ok(n)
}
