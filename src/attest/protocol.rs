//! The attestation flow.
//!
//! Each step consumes the previous one, so cells can only be sampled once the
//! roots are on record:
//!
//! ```text
//! Seeded --commit--> Committed --challenge--> Challenged --respond--> Responded --verify
//! ```
use std::{collections::BTreeMap, sync::Arc};

use rand::{CryptoRng, RngCore};

use super::{
    identity, quorum,
    verifier::{verify_all, GpuCase, Tolerance},
    Attestation, AttestError, Cell, GpuId, GpuVerdict, SeedPair,
};
use crate::{
    config::Policy,
    gpu::Measurement,
    matrix::{adjust_matrix_size, check_size, BLOCK_ALIGNMENT},
    merkle::{Digest, Hasher, Sha256},
    outcome::Outcome,
    remote::{CommitReport, IndicesFile, ProofResponses, ProverSession, RemoteChannel, SeedsFile},
};

/// Fresh seeds for every GPU.
#[derive(Debug, Clone)]
pub struct Seeded {
    n: usize,
    seeds: BTreeMap<GpuId, SeedPair>,
}

impl Seeded {
    pub fn new<R>(num_gpus: u32, n: usize, rng: &mut R) -> Result<Self, rand::Error>
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let seeds = (0..num_gpus)
            .map(|gpu| Ok((gpu, SeedPair::random(rng)?)))
            .collect::<Result<_, rand::Error>>()?;
        Ok(Self { n, seeds })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn seeds_file(&self) -> SeedsFile {
        SeedsFile {
            n: self.n,
            seeds: self.seeds.clone(),
        }
    }

    /// Record the roots the prover committed to.
    pub fn commit(self, report: CommitReport) -> Committed {
        self.from_roots(report.roots)
    }

    pub fn from_roots(self, mut roots: BTreeMap<GpuId, Digest>) -> Committed {
        // roots of GPUs that were never seeded are ignored
        roots.retain(|gpu, _| self.seeds.contains_key(gpu));
        Committed { seeded: self, roots }
    }
}

/// Seeds and the roots received for them.
#[derive(Debug, Clone)]
pub struct Committed {
    seeded: Seeded,
    roots: BTreeMap<GpuId, Digest>,
}

impl Committed {
    pub fn roots(&self) -> &BTreeMap<GpuId, Digest> {
        &self.roots
    }

    /// Sample `per_gpu` cells for every GPU that committed.
    pub fn challenge<R>(self, rng: &mut R, per_gpu: usize) -> Challenged
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let n = self.seeded.n;
        let cells = self
            .roots
            .keys()
            .map(|gpu| (*gpu, super::sample_cells(rng, n, per_gpu)))
            .collect();
        Challenged { committed: self, cells }
    }
}

/// Committed state plus the cells disclosed to the prover.
#[derive(Debug, Clone)]
pub struct Challenged {
    committed: Committed,
    cells: BTreeMap<GpuId, Vec<Cell>>,
}

impl Challenged {
    pub fn indices_file(&self) -> IndicesFile {
        IndicesFile {
            cells: self.cells.clone(),
        }
    }

    pub fn respond(self, responses: ProofResponses) -> Responded {
        Responded {
            challenged: self,
            responses,
        }
    }
}

pub struct Responded {
    challenged: Challenged,
    responses: ProofResponses,
}

impl Responded {
    /// Verdict of every seeded GPU.
    pub fn verify<H: Hasher>(&self, tolerance: &Tolerance) -> BTreeMap<GpuId, GpuVerdict> {
        let committed = &self.challenged.committed;
        let no_cells = Vec::new();
        let cases: BTreeMap<GpuId, GpuCase<'_>> = committed
            .seeded
            .seeds
            .iter()
            .map(|(gpu, seeds)| {
                let case = GpuCase {
                    seeds: *seeds,
                    root: committed.roots.get(gpu).copied(),
                    challenged: self.challenged.cells.get(gpu).unwrap_or(&no_cells),
                    response: self.responses.get(gpu),
                };
                (*gpu, case)
            })
            .collect();
        verify_all::<H>(committed.seeded.n, &cases, tolerance)
    }
}

/// What the miner claims to have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuClaim {
    pub name: Option<String>,
    pub count: u32,
}

/// Runs the whole flow against one miner.
#[derive(Clone)]
pub struct Attestor {
    policy: Arc<Policy>,
}

impl Attestor {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    /// Matrix size to use for GPUs with `vram_gb` of memory.
    pub fn matrix_size(&self, vram_gb: f64) -> usize {
        let cfg = &self.policy.attest;
        let n = cfg
            .matrix_size
            .unwrap_or_else(|| adjust_matrix_size(vram_gb, cfg.element_size, cfg.buffer_factor));
        match cfg.max_matrix_size {
            Some(max) => n.min(max / BLOCK_ALIGNMENT * BLOCK_ALIGNMENT),
            None => n,
        }
    }

    /// Attest the GPUs behind `channel`.
    ///
    /// Only a failing random source aborts, anything the miner does wrong ends
    /// in a failed attestation.
    pub fn attest<R>(
        &self,
        channel: &dyn RemoteChannel,
        claim: &GpuClaim,
        rng: &mut R,
    ) -> Result<Attestation, AttestError>
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let session = ProverSession::new(channel, &self.policy.attest)
            .map_err(|e| AttestError::Setup(format!("creating work directory: {e}")))?;
        let result = self.run(&session, claim, rng);
        session.cleanup();
        result
    }

    fn run<R>(&self, session: &ProverSession<'_>, claim: &GpuClaim, rng: &mut R) -> Result<Attestation, AttestError>
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let cfg = &self.policy.attest;
        let report = match session.benchmark() {
            Ok(report) => report,
            Err(e) => {
                log::info!("attestation failed at benchmark: {e}");
                return Ok(Attestation::failed(Outcome::from(&e)));
            }
        };
        let measurement: Measurement = report.measurement();
        let identified_gpu = self.policy.gpus.identify(&measurement, claim.name.as_deref());
        log::debug!("benchmark {report:?}, identified as {identified_gpu:?}");

        let mut attestation = Attestation {
            num_gpus: report.num_gpus,
            identified_gpu,
            ..Attestation::failed(Outcome::PolicyViolation)
        };
        if report.num_gpus == 0 {
            log::info!("miner reports no GPUs");
            return Ok(attestation);
        }
        if report.num_gpus > cfg.max_gpus {
            log::info!("miner reports {} GPUs, at most {} allowed", report.num_gpus, cfg.max_gpus);
            return Ok(attestation);
        }
        if claim.count != 0 && claim.count != report.num_gpus {
            log::info!("miner claims {} GPUs, benchmark found {}", claim.count, report.num_gpus);
            attestation.outcome = Outcome::Spoofed;
            return Ok(attestation);
        }

        let n = self.matrix_size(measurement.vram_gb);
        attestation.matrix_size = n;
        if let Err(e) = check_size(n, cfg.min_matrix_size) {
            log::info!("cannot attest: {e}");
            return Ok(attestation);
        }

        let seeded = Seeded::new(report.num_gpus, n, rng)?;
        let commit = match session.commit(&seeded.seeds_file()) {
            Ok(commit) => commit,
            Err(e) => {
                log::info!("attestation failed at commit: {e}");
                attestation.outcome = Outcome::from(&e);
                return Ok(attestation);
            }
        };
        let seeds_file = seeded.seeds_file();
        let challenged = seeded.commit(commit).challenge(rng, cfg.challenges_per_gpu);

        let (responses, respond_error) = match session.respond(&seeds_file, &challenged.indices_file()) {
            Ok(responses) => (responses, None),
            Err(e) => {
                log::info!("fetching proofs failed: {e}");
                (ProofResponses::new(), Some(e))
            }
        };
        let per_gpu = challenged.respond(responses).verify::<Sha256>(&Tolerance::from(cfg));
        let passes = per_gpu.values().filter(|v| v.is_ok()).count();
        attestation.overall_pass = quorum::has_quorum(passes, report.num_gpus as usize);
        attestation.outcome = match (attestation.overall_pass, &respond_error) {
            (true, _) => Outcome::Passed,
            (false, Some(e)) => Outcome::from(e),
            (false, None) => Outcome::FailedQuorum,
        };
        attestation.per_gpu = per_gpu;
        log::info!(
            "{passes}/{} GPUs passed (required {})",
            report.num_gpus,
            quorum::required_passes(report.num_gpus as usize)
        );

        if attestation.overall_pass && cfg.check_device_identity {
            let verdict = session
                .identities()
                .map_err(|e| Outcome::from(&e))
                .and_then(|ids| {
                    identity::check(&ids, report.num_gpus as usize).map_err(|e| {
                        log::info!("device identity check failed: {e}");
                        Outcome::Spoofed
                    })
                });
            if let Err(outcome) = verdict {
                attestation.overall_pass = false;
                attestation.outcome = outcome;
            }
        }
        Ok(attestation)
    }
}
