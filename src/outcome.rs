use std::fmt;

use serde::Serialize;

/// How a miner's round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// Too few GPUs passed verification.
    FailedQuorum,
    /// The miner could not be reached.
    Unreachable,
    /// The miner answered with something unparsable.
    Malformed,
    /// Device introspection contradicts the claimed hardware.
    Spoofed,
    /// The miner's setup violates the policy, e.g. a matrix too small to attest.
    PolicyViolation,
    WrongAnswer,
    /// The miner reported an error instead of an answer.
    Failed,
    /// The miner did not answer in time.
    TimedOut,
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        *self == Outcome::Passed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::FailedQuorum => "failed_quorum",
            Outcome::Unreachable => "unreachable",
            Outcome::Malformed => "malformed",
            Outcome::Spoofed => "spoofed",
            Outcome::PolicyViolation => "policy_violation",
            Outcome::WrongAnswer => "wrong_answer",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&crate::remote::Error> for Outcome {
    fn from(e: &crate::remote::Error) -> Self {
        match e {
            crate::remote::Error::Malformed(_) => Outcome::Malformed,
            crate::remote::Error::Timeout(_) => Outcome::TimedOut,
            _ => Outcome::Unreachable,
        }
    }
}

impl From<crate::pow::RunState> for Outcome {
    fn from(state: crate::pow::RunState) -> Self {
        match state {
            crate::pow::RunState::Solved => Outcome::Passed,
            crate::pow::RunState::WrongAnswer => Outcome::WrongAnswer,
            crate::pow::RunState::TimedOut => Outcome::TimedOut,
            crate::pow::RunState::Failed => Outcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            "\"failed_quorum\"",
            serde_json::to_string(&Outcome::FailedQuorum).unwrap()
        );
        assert_eq!("policy_violation", Outcome::PolicyViolation.to_string());
    }

    #[test]
    fn errors_are_not_wrong_answers() {
        use crate::pow::RunState;

        assert_eq!(Outcome::Failed, Outcome::from(RunState::Failed));
        assert_eq!(Outcome::WrongAnswer, Outcome::from(RunState::WrongAnswer));
        assert_ne!(Outcome::from(RunState::Failed), Outcome::from(RunState::WrongAnswer));
    }
}
