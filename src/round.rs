//! Validation rounds over all registered miners.
//!
//! Miners are handled in batches of `round.batch_size`; a batch finishes
//! completely before the next one starts. A miner failing in any way only
//! fails that miner.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use eyre::WrapErr;
use futures::future::{join_all, BoxFuture};
use mockall::automock;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tokio::time::Instant;

use crate::{
    attest::{protocol::GpuClaim, Attestation, Attestor, GpuId, GpuVerdict},
    config::Policy,
    outcome::Outcome,
    pow::{self, Challenge, ChallengeResult, RunState},
    remote::{self, RemoteChannel},
    score::{score, score_pog, ChallengeStats, DifficultyTracker},
};

/// Miner hotkey.
pub type MinerId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerInfo {
    pub id: MinerId,
    pub address: String,
    pub trusted: bool,
    pub allocated: bool,
    pub claim: GpuClaim,
}

#[automock]
pub trait MinerRegistry {
    fn miners(&self) -> Vec<MinerInfo>;
}

/// Opens command channels to miner hosts.
#[automock]
pub trait Connector {
    fn connect(&self, miner: &MinerInfo) -> Result<Box<dyn RemoteChannel + Send + Sync>, remote::Error>;
}

/// Delivers PoW challenges to miners.
#[automock]
pub trait Dispatcher {
    fn dispatch(
        &self,
        miner: &MinerInfo,
        challenge: &Challenge,
    ) -> BoxFuture<'static, Result<ChallengeResult, remote::Error>>;
}

#[derive(Debug, Clone)]
pub struct MinerReport {
    pub overall_pass: bool,
    pub per_gpu: BTreeMap<GpuId, GpuVerdict>,
    pub identified_gpu: Option<String>,
    pub score: f64,
    pub outcome: Outcome,
}

impl MinerReport {
    fn failed(outcome: Outcome) -> Self {
        Self {
            overall_pass: false,
            per_gpu: BTreeMap::new(),
            identified_gpu: None,
            score: 0.0,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub miners: BTreeMap<MinerId, MinerReport>,
}

impl RoundReport {
    /// Number of miners per outcome.
    pub fn summary(&self) -> BTreeMap<Outcome, usize> {
        let mut summary = BTreeMap::new();
        for report in self.miners.values() {
            *summary.entry(report.outcome).or_default() += 1;
        }
        summary
    }

    fn log_summary(&self, kind: &str) {
        let summary = self
            .summary()
            .iter()
            .map(|(outcome, count)| format!("{outcome}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!("{kind} round over {} miners finished ({summary})", self.miners.len());
    }
}

/// Difficulty and history of PoW challenges, kept across rounds.
#[derive(Debug, Clone)]
pub struct PowState {
    pub tracker: DifficultyTracker,
    pub stats: HashMap<MinerId, ChallengeStats>,
    window: usize,
}

impl PowState {
    pub fn new(policy: &Policy) -> Self {
        Self {
            tracker: DifficultyTracker::new(policy),
            stats: HashMap::new(),
            window: policy.score.stats_window,
        }
    }

    fn record(&mut self, miner: &MinerId, difficulty: u32, elapsed: f64, solved: bool) {
        self.tracker.record(miner, solved);
        self.stats
            .entry(miner.clone())
            .or_insert_with(|| ChallengeStats::new(self.window))
            .push(difficulty, elapsed, solved);
    }
}

pub struct RoundDriver {
    policy: Arc<Policy>,
    registry: Arc<dyn MinerRegistry + Send + Sync>,
    attestor: Attestor,
}

fn attestation_report(policy: &Policy, miner: &MinerInfo, attestation: Attestation) -> MinerReport {
    let score = match (&attestation.identified_gpu, attestation.overall_pass) {
        (Some(gpu), true) => score_pog(policy, gpu, attestation.num_gpus, miner.allocated),
        _ => 0.0,
    };
    MinerReport {
        overall_pass: attestation.overall_pass,
        per_gpu: attestation.per_gpu,
        identified_gpu: attestation.identified_gpu,
        score,
        outcome: attestation.outcome,
    }
}

fn attest_miner(
    attestor: &Attestor,
    policy: &Policy,
    connector: &(dyn Connector + Send + Sync),
    miner: &MinerInfo,
) -> Result<MinerReport, crate::attest::AttestError> {
    let channel = match connector.connect(miner) {
        Ok(channel) => channel,
        Err(e) => {
            log::info!("miner {}: cannot connect to {}: {e}", miner.id, miner.address);
            return Ok(MinerReport::failed(Outcome::from(&e)));
        }
    };
    let attestation = attestor.attest(&*channel, &miner.claim, &mut OsRng)?;
    log::info!(
        "miner {}: {} ({}/{} GPUs passed, identified as {:?})",
        miner.id,
        attestation.outcome,
        attestation.passed_gpus(),
        attestation.num_gpus,
        attestation.identified_gpu
    );
    Ok(attestation_report(policy, miner, attestation))
}

impl RoundDriver {
    pub fn new(policy: Arc<Policy>, registry: Arc<dyn MinerRegistry + Send + Sync>) -> Self {
        Self {
            attestor: Attestor::new(policy.clone()),
            policy,
            registry,
        }
    }

    fn batch_size(&self) -> usize {
        self.policy.round.batch_size.max(1)
    }

    /// Attest the GPUs of every miner.
    ///
    /// Fails only if the validator itself cannot run the round.
    pub async fn attest_round(&self, connector: Arc<dyn Connector + Send + Sync>) -> eyre::Result<RoundReport> {
        let miners = self.registry.miners();
        let mut report = RoundReport::default();

        for batch in miners.chunks(self.batch_size()) {
            let tasks = batch.iter().cloned().map(|miner| {
                let (attestor, policy, connector) = (self.attestor.clone(), self.policy.clone(), connector.clone());
                tokio::task::spawn_blocking(move || {
                    let result = attest_miner(&attestor, &policy, &*connector, &miner);
                    (miner.id, result)
                })
            });
            for joined in join_all(tasks).await {
                let (id, result) = joined.wrap_err("attestation task failed")?;
                let miner_report = result.wrap_err_with(|| format!("attesting miner {id}"))?;
                report.miners.insert(id, miner_report);
            }
        }
        report.log_summary("attestation");
        Ok(report)
    }

    /// Send every miner a challenge at its current difficulty.
    pub async fn pow_round<R>(
        &self,
        dispatcher: Arc<dyn Dispatcher + Send + Sync>,
        state: &mut PowState,
        rng: &mut R,
    ) -> RoundReport
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let miners = self.registry.miners();
        let timeout = self.policy.pow.timeout;
        let mut report = RoundReport::default();

        for batch in miners.chunks(self.batch_size()) {
            let challenges: Vec<(MinerInfo, Challenge)> = batch
                .iter()
                .map(|miner| {
                    let difficulty = state.tracker.difficulty(&miner.id);
                    let (challenge, _) = pow::generate(difficulty, &self.policy.pow, rng);
                    (miner.clone(), challenge)
                })
                .collect();

            let runs = challenges.iter().map(|(miner, challenge)| {
                let dispatched = dispatcher.dispatch(miner, challenge);
                async move {
                    let start = Instant::now();
                    let result = tokio::time::timeout(timeout, dispatched).await;
                    (result, start.elapsed())
                }
            });
            let results = join_all(runs).await;

            for ((miner, challenge), (result, elapsed)) in challenges.into_iter().zip(results) {
                let (outcome, solved) = self.judge(&miner, &challenge, result, elapsed, timeout);
                let score = if solved {
                    score(&self.policy, challenge.difficulty, elapsed.as_secs_f64(), miner.trusted)
                } else {
                    0.0
                };
                state.record(&miner.id, challenge.difficulty, elapsed.as_secs_f64(), solved);
                log::info!(
                    "miner {}: {outcome} at difficulty {} in {:.2}s (score {score:.2})",
                    miner.id,
                    challenge.difficulty,
                    elapsed.as_secs_f64()
                );
                report.miners.insert(
                    miner.id,
                    MinerReport {
                        overall_pass: solved,
                        per_gpu: BTreeMap::new(),
                        identified_gpu: None,
                        score,
                        outcome,
                    },
                );
            }
        }
        report.log_summary("pow");
        report
    }

    fn judge(
        &self,
        miner: &MinerInfo,
        challenge: &Challenge,
        result: Result<Result<ChallengeResult, remote::Error>, tokio::time::error::Elapsed>,
        elapsed: Duration,
        timeout: Duration,
    ) -> (Outcome, bool) {
        match result {
            Err(_) => (Outcome::TimedOut, false),
            Ok(Err(e)) => {
                log::debug!("miner {}: dispatch failed: {e}", miner.id);
                (Outcome::from(&e), false)
            }
            Ok(Ok(answer)) => {
                let state = RunState::classify(challenge, &answer, elapsed, timeout);
                (Outcome::from(state), state == RunState::Solved)
            }
        }
    }
}
