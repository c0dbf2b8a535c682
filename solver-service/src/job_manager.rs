use pog::pow::{solver::SolverService, Challenge, ChallengeResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, PartialEq)]
pub enum JobError {
    #[error("too many active jobs")]
    TooManyJobs,
    #[error("{0}")]
    InvalidChallenge(String),
}

/// JobStatus is used to expose job state to external callers
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    Created,
    InProgress,
    Done(ChallengeResult),
}

#[derive(Debug)]
enum JobState {
    InProgress,
    Done(ChallengeResult, Instant),
}

#[cfg_attr(test, mockall::automock)]
pub trait GetOrCreate {
    fn get_or_create(&self, job: Challenge) -> Result<JobStatus, JobError>;
}

type Jobs = Arc<Mutex<HashMap<Challenge, JobState>>>;

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<Challenge, JobState>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs challenges on the solver in the background.
///
/// A finished job is handed out once and then forgotten. Results nobody
/// asked for within the solver timeout are dropped when new jobs arrive.
pub struct JobManager {
    jobs: Jobs,
    solver: Arc<SolverService>,
}

impl JobManager {
    pub fn new(solver: Arc<SolverService>) -> Self {
        JobManager {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            solver,
        }
    }
}

impl GetOrCreate for JobManager {
    fn get_or_create(&self, job: Challenge) -> Result<JobStatus, JobError> {
        let mut hs = lock(&self.jobs);

        match hs.get(&job) {
            Some(JobState::InProgress) => Ok(JobStatus::InProgress),
            Some(JobState::Done(..)) => match hs.remove(&job) {
                Some(JobState::Done(result, _)) => Ok(JobStatus::Done(result)),
                _ => Ok(JobStatus::InProgress),
            },
            None => {
                job.validate()
                    .map_err(|e| JobError::InvalidChallenge(e.to_string()))?;
                let ttl = self.solver.timeout();
                hs.retain(|_, state| !matches!(state, JobState::Done(_, at) if at.elapsed() > ttl));
                let running = hs
                    .values()
                    .filter(|v| matches!(v, JobState::InProgress))
                    .count();
                if running >= self.solver.max_concurrent() {
                    return Err(JobError::TooManyJobs);
                }

                tracing::info!(
                    "took challenge: mode: {}, difficulty: {}, charset size: {}",
                    job.mode,
                    job.difficulty,
                    job.chars.chars().count()
                );
                hs.insert(job.clone(), JobState::InProgress);

                let (jobs, solver) = (self.jobs.clone(), self.solver.clone());
                tokio::spawn(async move {
                    let result = solver.solve(&job).await;
                    tracing::debug!("challenge result: {result:?}");
                    lock(&jobs).insert(job, JobState::Done(result, Instant::now()));
                });
                Ok(JobStatus::Created)
            }
        }
    }
}
