//! How many of a miner's GPUs must pass for the miner to pass.

/// Passing GPUs required out of `k`.
///
/// Small rigs get little slack: up to two GPUs must all pass, three and four
/// may lose one, larger rigs need three quarters (rounded up).
pub fn required_passes(k: usize) -> usize {
    match k {
        0..=2 => k,
        3 => 2,
        4 => 3,
        _ => (3 * k).div_ceil(4),
    }
}

pub fn has_quorum(passes: usize, k: usize) -> bool {
    k > 0 && passes <= k && passes >= required_passes(k)
}
