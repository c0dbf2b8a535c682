//! Validation policy.
//!
//! The built-in policy (`policy.yml`) is layered under an optional policy file
//! and `POG_` prefixed environment variables, e.g. `POG_POW__MAX_DIFFICULTY=10`.
use std::{path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSeconds};

use crate::{gpu::GpuTable, pow::HashMode};

const BUILTIN_POLICY: &str = include_str!("policy.yml");

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("loading policy: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

macro_rules! require {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(Error::Invalid(format!($($arg)+)));
        }
    };
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct PowConfig {
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    /// Time a miner has to answer a challenge.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Challenges solved at once by a solver instance.
    pub max_concurrent: usize,
    /// Alphabet the challenge characters are drawn from.
    pub charset: String,
    /// Number of distinct characters a password is made of.
    pub charset_size: usize,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub modes: Vec<HashMode>,
}

impl PowConfig {
    pub fn clamp_difficulty(&self, difficulty: u32) -> u32 {
        difficulty.clamp(self.min_difficulty, self.max_difficulty)
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct AttestConfig {
    /// Cells challenged per GPU.
    pub challenges_per_gpu: usize,
    pub atol: f64,
    pub rtol: f64,
    pub min_matrix_size: usize,
    /// Fixed matrix size. Derived from the measured VRAM if unset.
    #[serde(default)]
    pub matrix_size: Option<usize>,
    /// Upper bound for the derived matrix size.
    #[serde(default)]
    pub max_matrix_size: Option<usize>,
    pub element_size: usize,
    pub buffer_factor: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub remote_timeout: Duration,
    /// Time the prover has to compute the product and the commitment.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub compute_timeout: Duration,
    /// Prover command on the miner host.
    pub prover_command: String,
    /// Miner directory the artifacts are exchanged through.
    pub remote_dir: String,
    pub check_device_identity: bool,
    /// Most GPUs a single miner may report.
    pub max_gpus: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreConfig {
    pub difficulty_weight: f64,
    pub time_weight: f64,
    pub base: f64,
    pub registration_bonus: f64,
    pub max_gpus: u32,
    pub allocation_multiplier: f64,
    pub stats_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoundConfig {
    /// Miners challenged at once.
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    pub pow: PowConfig,
    pub attest: AttestConfig,
    pub score: ScoreConfig,
    pub round: RoundConfig,
    pub gpus: GpuTable,
}

impl Policy {
    /// Load the policy, optionally overridden by a YAML file.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = ::config::Config::builder().add_source(::config::File::from_str(
            BUILTIN_POLICY,
            ::config::FileFormat::Yaml,
        ));
        if let Some(path) = path {
            log::info!("loading policy from {path:?}");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let policy: Policy = builder
            .add_source(
                ::config::Environment::with_prefix("POG")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        policy.validate()?;
        Ok(policy)
    }

    /// The built-in policy without any overrides.
    pub fn builtin() -> Result<Self, Error> {
        let policy: Policy = ::config::Config::builder()
            .add_source(::config::File::from_str(
                BUILTIN_POLICY,
                ::config::FileFormat::Yaml,
            ))
            .build()?
            .try_deserialize()?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let pow = &self.pow;
        require!(pow.min_difficulty > 0, "pow.min_difficulty must be positive");
        require!(
            pow.min_difficulty <= pow.max_difficulty,
            "pow.min_difficulty ({}) > pow.max_difficulty ({})",
            pow.min_difficulty,
            pow.max_difficulty
        );
        require!(pow.max_concurrent > 0, "pow.max_concurrent must be positive");
        require!(!pow.timeout.is_zero(), "pow.timeout must be positive");
        require!(!pow.modes.is_empty(), "pow.modes is empty");
        let distinct = pow.charset.chars().collect::<std::collections::BTreeSet<_>>();
        require!(
            pow.charset_size > 0 && distinct.len() >= pow.charset_size,
            "pow.charset has {} distinct characters, {} required",
            distinct.len(),
            pow.charset_size
        );

        let attest = &self.attest;
        require!(attest.challenges_per_gpu > 0, "attest.challenges_per_gpu must be positive");
        require!(
            attest.atol >= 0.0 && attest.rtol >= 0.0,
            "attest tolerances must not be negative"
        );
        require!(attest.element_size > 0, "attest.element_size must be positive");
        require!(
            attest.buffer_factor > 0.0 && attest.buffer_factor <= 1.0,
            "attest.buffer_factor must be in (0, 1]"
        );
        require!(attest.max_gpus > 0, "attest.max_gpus must be positive");
        if let Some(n) = attest.matrix_size {
            crate::matrix::check_size(n, attest.min_matrix_size)
                .map_err(|e| Error::Invalid(format!("attest.matrix_size: {e}")))?;
        }

        let score = &self.score;
        require!(score.max_gpus > 0, "score.max_gpus must be positive");
        require!(score.stats_window > 0, "score.stats_window must be positive");
        require!(self.round.batch_size > 0, "round.batch_size must be positive");

        require!(!self.gpus.cards.is_empty(), "gpus.cards is empty");
        for (a, b) in &self.gpus.tolerance_pairs {
            require!(
                self.gpus.get(a).is_some() && self.gpus.get(b).is_some(),
                "tolerance pair ({a}, {b}) names an unknown card"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn builtin_policy() {
        let policy = Policy::builtin().unwrap();
        assert_eq!(7, policy.pow.min_difficulty);
        assert_eq!(12, policy.pow.max_difficulty);
        assert_eq!(Duration::from_secs(30), policy.pow.timeout);
        assert_eq!(vec![HashMode::Blake2b], policy.pow.modes);
        assert_eq!(1e-5, policy.attest.atol);
        assert_eq!(None, policy.attest.matrix_size);
        assert_eq!(16, policy.attest.max_gpus);
        assert_eq!(
            Some(1.0),
            policy.gpus.get("NVIDIA L40").map(|spec| spec.score)
        );
        // names survive with their case and punctuation intact
        assert!(policy.gpus.get("NVIDIA A100-SXM4-80GB").is_some());
        assert!(policy
            .gpus
            .is_tolerated("NVIDIA RTX 6000 Ada Generation", "NVIDIA L40"));
    }

    #[test]
    fn clamps_difficulty() {
        let policy = Policy::builtin().unwrap();
        assert_eq!(12, policy.pow.clamp_difficulty(99));
        assert_eq!(7, policy.pow.clamp_difficulty(0));
        assert_eq!(9, policy.pow.clamp_difficulty(9));
    }

    #[test]
    fn file_overrides_builtin() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "pow:\n  max_difficulty: 9\n  modes: [\"1410\", \"1710\"]\nattest:\n  matrix_size: 2048"
        )
        .unwrap();

        let policy = Policy::load(Some(file.path())).unwrap();
        assert_eq!(9, policy.pow.max_difficulty);
        assert_eq!(7, policy.pow.min_difficulty);
        assert_eq!(vec![HashMode::Sha256, HashMode::Sha512], policy.pow.modes);
        assert_eq!(Some(2048), policy.attest.matrix_size);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "pow:\n  min_difficulty: 12\n  max_difficulty: 7").unwrap();
        assert!(matches!(
            Policy::load(Some(file.path())),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_gpu_bound() {
        let mut policy = Policy::builtin().unwrap();
        policy.attest.max_gpus = 0;
        let err = policy.validate().unwrap_err();
        assert_eq!(
            "invalid policy: attest.max_gpus must be positive",
            err.to_string()
        );
    }

    #[test]
    fn rejects_unaligned_matrix_size() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "attest:\n  matrix_size: 1000").unwrap();
        assert!(matches!(
            Policy::load(Some(file.path())),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Policy::load(Some(Path::new("/does/not/exist.yml"))),
            Err(Error::Load(_))
        ));
    }
}
