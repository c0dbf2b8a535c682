use std::{
    thread,
    time::{Duration, Instant},
};

use reqwest::StatusCode;

use super::{Challenge, ChallengeResult, Error};

const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Client of a remote solver service.
///
/// The service answers `201` while the job is queued or running and `429`
/// when it is full; both are retried after a backoff.
pub struct SolverClient {
    url: String,
    backoff: Duration,
    client: reqwest::blocking::Client,
}

impl SolverClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            backoff: DEFAULT_BACKOFF,
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn job_url(&self) -> String {
        format!("{}/job", self.url)
    }

    pub fn solve(&self, challenge: &Challenge, timeout: Duration) -> Result<ChallengeResult, Error> {
        let deadline = Instant::now() + timeout;
        let uri = self.job_url();
        loop {
            let res = self
                .client
                .post(&uri)
                .json(challenge)
                .send()
                .map_err(|e| Error::Internal(format!("sending job: {e}")))?;
            let status = res.status();
            match status {
                StatusCode::OK => {
                    return res
                        .json::<ChallengeResult>()
                        .map_err(|e| Error::Internal(format!("decoding result: {e}")));
                }
                StatusCode::CREATED | StatusCode::TOO_MANY_REQUESTS => {
                    if Instant::now() + self.backoff > deadline {
                        return Err(Error::Timeout);
                    }
                    thread::sleep(self.backoff);
                }
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    return Err(Error::InvalidChallenge(res.text().unwrap_or_default()));
                }
                StatusCode::INTERNAL_SERVER_ERROR => {
                    return Err(Error::Internal(res.text().unwrap_or_default()));
                }
                _ => return Err(Error::Internal(format!("unexpected status code {status}"))),
            }
        }
    }
}
