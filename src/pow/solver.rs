//! Miner-side challenge solving with bounded concurrency.
//!
//! Runs are admitted in arrival order through a fair semaphore owned by the
//! solver. The challenge timeout covers both the wait and the run: a run still
//! queued when it expires is never started.
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{sync::Semaphore, time::Instant};

use super::{crack::Cracker, Challenge, ChallengeResult, Error};

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SolverService {
    cracker: Arc<dyn Cracker + Send + Sync>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
    active: AtomicUsize,
    runs: AtomicU64,
}

impl SolverService {
    pub fn new(cracker: Arc<dyn Cracker + Send + Sync>, max_concurrent: usize, timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            cracker,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            timeout,
            active: AtomicUsize::new(0),
            runs: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of runs currently executing (not waiting).
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn solve(&self, challenge: &Challenge) -> ChallengeResult {
        let started = Instant::now();
        if let Err(e) = challenge.validate() {
            return ChallengeResult::new(Err(e), started.elapsed());
        }
        let run_id = format!("pog-{}", self.runs.fetch_add(1, Ordering::Relaxed));

        let permit = match tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return ChallengeResult::new(Err(Error::Internal(e.to_string())), started.elapsed()),
            Err(_) => {
                log::warn!("run {run_id} waited {:?} without starting", self.timeout);
                return ChallengeResult::new(Err(Error::NotStarted), started.elapsed());
            }
        };
        let remaining = self.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return ChallengeResult::new(Err(Error::NotStarted), started.elapsed());
        }

        log::debug!(
            "run {run_id} started (difficulty: {}, mode: {}, budget: {remaining:?})",
            challenge.difficulty,
            challenge.mode
        );
        let outcome = {
            let _active = ActiveGuard::new(&self.active);
            match tokio::time::timeout(remaining, self.cracker.crack(&run_id, challenge, remaining)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout),
            }
        };
        drop(permit);

        let result = ChallengeResult::new(outcome, started.elapsed());
        match &result.error {
            None => log::info!("run {run_id} solved in {:.2}s", result.elapsed_time),
            Some(e) => log::info!("run {run_id} failed after {:.2}s: {e}", result.elapsed_time),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::pow::{crack::MockCracker, HashMode};

    fn challenge() -> Challenge {
        Challenge {
            hash: "hash".into(),
            salt: "salt".into(),
            mode: HashMode::Blake2b,
            chars: "abc".into(),
            mask: "?1?1".into(),
            difficulty: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn solves() {
        let mut cracker = MockCracker::new();
        cracker
            .expect_crack()
            .times(1)
            .returning(|_, _, _| async { Ok("ab".to_string()) }.boxed());
        let solver = SolverService::new(Arc::new(cracker), 1, Duration::from_secs(30));

        let result = solver.solve(&challenge()).await;
        assert_eq!(Some("ab".into()), result.password);
        assert_eq!(None, result.error);
        assert_eq!(0, solver.active());
    }

    #[tokio::test(start_paused = true)]
    async fn execution_times_out() {
        let mut cracker = MockCracker::new();
        cracker.expect_crack().returning(|_, _, _| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("ab".to_string())
            }
            .boxed()
        });
        let solver = SolverService::new(Arc::new(cracker), 1, Duration::from_secs(30));

        let result = solver.solve(&challenge()).await;
        assert_eq!(None, result.password);
        assert_eq!(Some("execution timed out".into()), result.error);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_run_times_out_before_starting() {
        let mut cracker = MockCracker::new();
        cracker.expect_crack().times(1).returning(|_, _, _| {
            async {
                tokio::time::sleep(Duration::from_secs(40)).await;
                Err(Error::NotFound)
            }
            .boxed()
        });
        let solver = SolverService::new(Arc::new(cracker), 1, Duration::from_secs(30));

        let c = challenge();
        let (first, second) = tokio::join!(solver.solve(&c), solver.solve(&c));
        assert_eq!(Some("execution timed out".into()), first.error);
        assert_eq!(Some("timed out before starting".into()), second.error);
    }

    #[tokio::test]
    async fn rejects_invalid_challenge() {
        let solver = SolverService::new(Arc::new(MockCracker::new()), 1, Duration::from_secs(30));
        let mut c = challenge();
        c.mask = "?1".into();
        let result = solver.solve(&c).await;
        assert!(result.error.unwrap().starts_with("invalid challenge"));
    }
}
