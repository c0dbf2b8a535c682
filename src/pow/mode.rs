use std::{fmt, str::FromStr};

use blake2::Blake2b512;
use sha2::{Digest, Sha256, Sha512};

/// Salted hash schemes, identified by their hashcat mode number.
///
/// All of them hash the password followed by the salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashMode {
    /// `blake2b-512($pass.$salt)`, printed as `$BLAKE2$<hex>`.
    Blake2b,
    /// `sha256($pass.$salt)`
    Sha256,
    /// `sha512($pass.$salt)`
    Sha512,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported hash mode: {0}")]
pub struct UnknownMode(String);

impl HashMode {
    pub const ALL: [HashMode; 3] = [HashMode::Blake2b, HashMode::Sha256, HashMode::Sha512];

    /// The hashcat `-m` argument.
    pub fn id(&self) -> u32 {
        match self {
            HashMode::Blake2b => 610,
            HashMode::Sha256 => 1410,
            HashMode::Sha512 => 1710,
        }
    }

    /// Hash `password` salted with `salt`, formatted the way hashcat expects it.
    pub fn hash(&self, password: &[u8], salt: &[u8]) -> String {
        match self {
            HashMode::Blake2b => {
                let digest = Blake2b512::new()
                    .chain_update(password)
                    .chain_update(salt)
                    .finalize();
                format!("$BLAKE2${}", hex::encode(digest))
            }
            HashMode::Sha256 => {
                hex::encode(Sha256::new().chain_update(password).chain_update(salt).finalize())
            }
            HashMode::Sha512 => {
                hex::encode(Sha512::new().chain_update(password).chain_update(salt).finalize())
            }
        }
    }
}

impl fmt::Display for HashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for HashMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashMode::ALL
            .into_iter()
            .find(|mode| mode.id().to_string() == s.trim())
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}
