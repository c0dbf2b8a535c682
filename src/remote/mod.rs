//! Driving the prover on a miner host over a remote command channel.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use mockall::automock;
use thiserror::Error;

pub mod artifacts;

pub use artifacts::{
    BenchmarkReport, CellResponse, CommitReport, DeviceIdentity, GpuResponse, IndicesFile, ProofResponses,
    SeedsFile,
};

use crate::config::AttestConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed output: {0}")]
    Malformed(String),
    #[error("local io: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Command execution and file transfer on the miner host.
#[automock]
pub trait RemoteChannel {
    fn execute(&self, command: &str, timeout: Duration) -> Result<Output, Error>;
    fn put_file(&self, local: &Path, remote: &str, timeout: Duration) -> Result<(), Error>;
    fn get_file(&self, remote: &str, local: &Path, timeout: Duration) -> Result<(), Error>;
}

/// One attestation's worth of prover invocations.
///
/// Artifacts are staged in a local temporary directory that is removed on drop.
pub struct ProverSession<'a> {
    channel: &'a dyn RemoteChannel,
    command: String,
    remote_dir: String,
    timeout: Duration,
    compute_timeout: Duration,
    workdir: tempfile::TempDir,
}

impl<'a> ProverSession<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, cfg: &AttestConfig) -> std::io::Result<Self> {
        Ok(Self {
            channel,
            command: cfg.prover_command.clone(),
            remote_dir: cfg.remote_dir.trim_end_matches('/').to_string(),
            timeout: cfg.remote_timeout,
            compute_timeout: cfg.compute_timeout,
            workdir: tempfile::Builder::new().prefix("pog-").tempdir()?,
        })
    }

    fn local(&self, name: &str) -> PathBuf {
        self.workdir.path().join(name)
    }

    fn remote(&self, name: &str) -> String {
        format!("{}/{name}", self.remote_dir)
    }

    fn push(&self, name: &str, content: &str) -> Result<String, Error> {
        let local = self.local(name);
        std::fs::write(&local, content)?;
        let remote = self.remote(name);
        self.channel.put_file(&local, &remote, self.timeout)?;
        Ok(remote)
    }

    fn run(&self, args: &str, timeout: Duration) -> Result<String, Error> {
        let command = format!("{} {args}", self.command);
        log::debug!("running `{command}`");
        let output = self.channel.execute(&command, timeout)?;
        if output.stdout.trim().is_empty() && !output.stderr.trim().is_empty() {
            return Err(Error::Malformed(format!(
                "`{command}` printed nothing: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    pub fn benchmark(&self) -> Result<BenchmarkReport, Error> {
        self.run("benchmark", self.timeout)?.parse()
    }

    /// Send the seeds and have the prover commit to the products.
    pub fn commit(&self, seeds: &SeedsFile) -> Result<CommitReport, Error> {
        let remote = self.push("seeds.txt", &seeds.to_string())?;
        let stdout = self.run(&format!("compute --seeds {remote}"), self.compute_timeout)?;
        serde_json::from_str(stdout.trim()).map_err(|e| Error::Malformed(format!("commit report: {e}")))
    }

    /// Disclose the challenged cells and fetch the answers.
    pub fn respond(&self, seeds: &SeedsFile, indices: &IndicesFile) -> Result<ProofResponses, Error> {
        let remote_seeds = self.push("seeds.txt", &seeds.to_string())?;
        let remote_indices = self.push("indices.txt", &indices.to_string())?;
        let remote_output = self.remote("proofs.json");
        self.run(
            &format!("proof --seeds {remote_seeds} --indices {remote_indices} --output {remote_output}"),
            self.compute_timeout,
        )?;

        let local = self.local("proofs.json");
        self.channel.get_file(&remote_output, &local, self.timeout)?;
        let content = std::fs::read_to_string(&local)?;
        serde_json::from_str(&content).map_err(|e| Error::Malformed(format!("proof responses: {e}")))
    }

    pub fn identities(&self) -> Result<Vec<DeviceIdentity>, Error> {
        let stdout = self.run("identity", self.timeout)?;
        serde_json::from_str(stdout.trim()).map_err(|e| Error::Malformed(format!("device identities: {e}")))
    }

    /// Remove the artifacts from the miner. Failures are only logged.
    pub fn cleanup(&self) {
        let command = format!(
            "rm -f {} {} {}",
            self.remote("seeds.txt"),
            self.remote("indices.txt"),
            self.remote("proofs.json")
        );
        if let Err(e) = self.channel.execute(&command, self.timeout) {
            log::debug!("cleaning up remote artifacts: {e}");
        }
    }
}
