//! Leading-zero proof of work.
//!
//! A nonce is valid when `blake2b-512(challenge || nonce_le)` starts with
//! `difficulty` zero nibbles.
use blake2::{Blake2b512, Digest};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};

use super::Error;

/// Nibbles in a blake2b-512 digest.
pub const MAX_DIFFICULTY: u32 = 128;

fn digest(challenge: &[u8], nonce: u64) -> [u8; 64] {
    Blake2b512::new()
        .chain_update(challenge)
        .chain_update(nonce.to_le_bytes())
        .finalize()
        .into()
}

/// Count leading zero nibbles of `hash`.
pub fn leading_zero_nibbles(hash: &[u8]) -> u32 {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

pub fn verify_nonce(challenge: &[u8], nonce: u64, difficulty: u32) -> bool {
    difficulty <= MAX_DIFFICULTY && leading_zero_nibbles(&digest(challenge, nonce)) >= difficulty
}

/// Search for a valid nonce on all cores.
pub fn find_nonce(challenge: &[u8], difficulty: u32) -> Result<u64, Error> {
    if difficulty > MAX_DIFFICULTY {
        return Err(Error::InvalidChallenge(format!(
            "difficulty {difficulty} exceeds {MAX_DIFFICULTY} nibbles"
        )));
    }
    (0..u64::MAX)
        .into_par_iter()
        .find_any(|&nonce| verify_nonce(challenge, nonce, difficulty))
        .ok_or(Error::NotFound)
}
