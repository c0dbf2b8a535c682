//! Password recovery backends.
use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt};
use mockall::automock;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};

use super::{Challenge, Error};

/// How often the brute-force search checks its deadline, in candidates.
const DEADLINE_CHECK_INTERVAL: u64 = 4096;

#[automock]
pub trait Cracker {
    /// Recover the password of `challenge` within `timeout`.
    ///
    /// `run_id` names the run, e.g. for hashcat's session file.
    fn crack(
        &self,
        run_id: &str,
        challenge: &Challenge,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<String, Error>>;
}

#[derive(Debug, Clone)]
pub struct HashcatCracker {
    binary: PathBuf,
    workload_profile: u8,
    extra_options: Vec<String>,
}

impl HashcatCracker {
    pub fn new(binary: impl Into<PathBuf>, workload_profile: u8, extra_options: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            workload_profile,
            extra_options,
        }
    }

    fn args(&self, run_id: &str, challenge: &Challenge, timeout: Duration) -> Vec<String> {
        let mut args = vec![
            format!("{}:{}", challenge.hash, challenge.salt),
            "-a".into(),
            "3".into(),
            "-D".into(),
            "2".into(),
            "-m".into(),
            challenge.mode.id().to_string(),
            "-1".into(),
            challenge.chars.clone(),
            challenge.mask.clone(),
            "-w".into(),
            self.workload_profile.to_string(),
            "--session".into(),
            run_id.to_string(),
            "--potfile-disable".into(),
            "--runtime".into(),
            timeout.as_secs().max(1).to_string(),
            "--quiet".into(),
        ];
        args.extend(self.extra_options.iter().cloned());
        args
    }
}

/// Find the password in hashcat output lines of the form `hash:salt:password`.
pub fn parse_hashcat_output(output: &str, challenge: &Challenge) -> Option<String> {
    let prefix = format!("{}:{}:", challenge.hash, challenge.salt);
    output
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(str::to_string)
}

impl Cracker for HashcatCracker {
    fn crack(
        &self,
        run_id: &str,
        challenge: &Challenge,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<String, Error>> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(self.args(run_id, challenge, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let challenge = challenge.clone();
        let run_id = run_id.to_string();

        async move {
            let child = command
                .spawn()
                .map_err(|e| Error::Internal(format!("spawning hashcat: {e}")))?;
            // dropping the future on timeout kills the child
            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|e| Error::Internal(format!("running hashcat: {e}")))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(password) = parse_hashcat_output(&stdout, &challenge) {
                return Ok(password);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::debug!("hashcat run {run_id} exited with {}: {stderr}", output.status);
            match output.status.code() {
                // 1 = exhausted
                Some(1) => Err(Error::NotFound),
                _ if stderr.trim().is_empty() => Err(Error::NotFound),
                _ => Err(Error::Internal(stderr.trim().to_string())),
            }
        }
        .boxed()
    }
}

/// In-process mask attack on the CPU.
#[derive(Debug, Clone, Default)]
pub struct BruteForceCracker {
    threads: Option<usize>,
}

impl BruteForceCracker {
    pub fn new(threads: Option<usize>) -> Self {
        Self { threads }
    }
}

fn candidate(alphabet: &[u8], length: usize, mut index: u64, buf: &mut Vec<u8>) {
    let base = alphabet.len() as u64;
    buf.clear();
    for _ in 0..length {
        buf.push(alphabet[(index % base) as usize]);
        index /= base;
    }
}

/// Search the whole mask space of `challenge` until `deadline`.
pub fn brute_force(challenge: &Challenge, deadline: Instant) -> Result<String, Error> {
    challenge.validate()?;
    if !challenge.chars.is_ascii() {
        return Err(Error::InvalidChallenge("non-ascii charset".into()));
    }
    let alphabet = challenge.chars.as_bytes();
    let length = challenge.difficulty as usize;
    let space = (alphabet.len() as u64)
        .checked_pow(challenge.difficulty)
        .ok_or_else(|| Error::InvalidChallenge("search space too large".into()))?;

    let found = (0..space).into_par_iter().find_map_any(|index| {
        if index % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() > deadline {
            return Some(Err(Error::Timeout));
        }
        let mut buf = Vec::with_capacity(length);
        candidate(alphabet, length, index, &mut buf);
        if challenge.mode.hash(&buf, challenge.salt.as_bytes()) == challenge.hash {
            return Some(Ok(String::from_utf8_lossy(&buf).into_owned()));
        }
        None
    });
    found.unwrap_or(Err(Error::NotFound))
}

impl Cracker for BruteForceCracker {
    fn crack(
        &self,
        _run_id: &str,
        challenge: &Challenge,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<String, Error>> {
        let challenge = challenge.clone();
        let threads = self.threads;
        async move {
            let deadline = Instant::now() + timeout;
            tokio::task::spawn_blocking(move || match threads {
                Some(threads) => rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| Error::Internal(e.to_string()))?
                    .install(|| brute_force(&challenge, deadline)),
                None => brute_force(&challenge, deadline),
            })
            .await
            .map_err(|e| Error::Internal(format!("brute force task failed: {e}")))?
        }
        .boxed()
    }
}

/// Cracker selected once at startup.
#[derive(Debug, Clone)]
pub enum CrackerBackend {
    Hashcat(HashcatCracker),
    BruteForce(BruteForceCracker),
}

impl CrackerBackend {
    /// Use hashcat if `hashcat --version` runs, the CPU search otherwise.
    pub fn detect(hashcat: HashcatCracker) -> Self {
        match std::process::Command::new(&hashcat.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {
                log::info!(
                    "using hashcat {} from {:?}",
                    String::from_utf8_lossy(&output.stdout).trim(),
                    hashcat.binary
                );
                CrackerBackend::Hashcat(hashcat)
            }
            Ok(output) => {
                log::warn!("hashcat --version failed ({}), falling back to CPU", output.status);
                CrackerBackend::BruteForce(BruteForceCracker::default())
            }
            Err(e) => {
                log::warn!("hashcat unavailable ({e}), falling back to CPU");
                CrackerBackend::BruteForce(BruteForceCracker::default())
            }
        }
    }
}

impl Cracker for CrackerBackend {
    fn crack(
        &self,
        run_id: &str,
        challenge: &Challenge,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<String, Error>> {
        match self {
            CrackerBackend::Hashcat(c) => c.crack(run_id, challenge, timeout),
            CrackerBackend::BruteForce(c) => c.crack(run_id, challenge, timeout),
        }
    }
}
