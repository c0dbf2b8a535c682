//! Password-hash proof of work.
//!
//! The validator hashes a random password drawn from a small random charset
//! and asks the miner to recover it. Recovering it takes a mask attack over
//! `charset_size ^ difficulty` candidates, verifying it takes one hash.

pub mod challenge;
pub mod client;
pub mod crack;
pub mod mode;
pub mod prefix;
pub mod solver;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;

pub use challenge::{generate, verify};
pub use mode::HashMode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("timed out before starting")]
    NotStarted,
    #[error("execution timed out")]
    Timeout,
    #[error("password not found")]
    NotFound,
    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),
    #[error("{0}")]
    Internal(String),
}

/// A challenge as sent to the miner.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "challenge_hash")]
    pub hash: String,
    #[serde(rename = "challenge_salt")]
    pub salt: String,
    #[serde(rename = "challenge_mode")]
    #[serde_as(as = "DisplayFromStr")]
    pub mode: HashMode,
    /// Characters of hashcat's custom charset 1.
    #[serde(rename = "challenge_chars")]
    pub chars: String,
    #[serde(rename = "challenge_mask")]
    pub mask: String,
    #[serde(rename = "challenge_difficulty")]
    pub difficulty: u32,
}

impl Challenge {
    /// Structural checks done before spending any work on a challenge.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidChallenge(msg.to_string()));
        if self.difficulty == 0 {
            return invalid("difficulty is zero");
        }
        if self.chars.is_empty() {
            return invalid("empty charset");
        }
        if self.mask != "?1".repeat(self.difficulty as usize) {
            return invalid("mask does not match difficulty");
        }
        if self.hash.is_empty() || self.salt.is_empty() {
            return invalid("missing hash or salt");
        }
        Ok(())
    }
}

/// What a miner returns for a challenge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChallengeResult {
    pub password: Option<String>,
    /// Seconds spent on the challenge.
    pub elapsed_time: f64,
    pub error: Option<String>,
}

impl ChallengeResult {
    pub fn new(outcome: Result<String, Error>, elapsed: Duration) -> Self {
        let elapsed_time = elapsed.as_secs_f64();
        match outcome {
            Ok(password) => Self {
                password: Some(password),
                elapsed_time,
                error: None,
            },
            Err(e) => Self {
                password: None,
                elapsed_time,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Final state of a challenge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Solved,
    WrongAnswer,
    TimedOut,
    Failed,
}

impl RunState {
    /// Judge a miner's answer. `elapsed` is measured by the caller.
    pub fn classify(
        challenge: &Challenge,
        result: &ChallengeResult,
        elapsed: Duration,
        timeout: Duration,
    ) -> Self {
        if elapsed > timeout {
            return RunState::TimedOut;
        }
        match (&result.password, &result.error) {
            (Some(password), _) if verify(challenge, password) => RunState::Solved,
            (Some(_), _) => RunState::WrongAnswer,
            (None, Some(error))
                if *error == Error::Timeout.to_string() || *error == Error::NotStarted.to_string() =>
            {
                RunState::TimedOut
            }
            (None, _) => RunState::Failed,
        }
    }
}
