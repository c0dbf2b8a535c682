use itertools::Itertools;
use rand::{seq::SliceRandom, CryptoRng, Rng, RngCore};

use super::{Challenge, HashMode};
use crate::config::PowConfig;

const SALT_BYTES: usize = 8;

/// Create a challenge of the given difficulty (clamped to the configured bounds).
///
/// Returns the challenge and the password it hides.
pub fn generate<R>(difficulty: u32, cfg: &PowConfig, rng: &mut R) -> (Challenge, String)
where
    R: RngCore + CryptoRng + ?Sized,
{
    let difficulty = cfg.clamp_difficulty(difficulty);
    let mode = cfg.modes.choose(rng).copied().unwrap_or(HashMode::Blake2b);

    let mut alphabet: Vec<char> = cfg.charset.chars().unique().collect();
    alphabet.shuffle(rng);
    alphabet.truncate(cfg.charset_size);

    let password: String = (0..difficulty)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect();

    let mut salt = [0u8; SALT_BYTES];
    rng.fill_bytes(&mut salt);
    let salt = hex::encode(salt);

    let challenge = Challenge {
        hash: mode.hash(password.as_bytes(), salt.as_bytes()),
        salt,
        mode,
        chars: alphabet.into_iter().collect(),
        mask: "?1".repeat(difficulty as usize),
        difficulty,
    };
    log::debug!(
        "generated challenge (mode: {mode}, difficulty: {difficulty}, chars: {})",
        challenge.chars
    );
    (challenge, password)
}

/// Check a recovered password against the challenge.
pub fn verify(challenge: &Challenge, password: &str) -> bool {
    challenge.mode.hash(password.as_bytes(), challenge.salt.as_bytes()) == challenge.hash
}
