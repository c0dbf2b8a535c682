use crate::job_manager::GetOrCreate;
use axum::response::IntoResponse;
use axum::routing::{get, post, Router};
use axum::{
    extract::State,
    http::{Request, StatusCode},
    response::Response,
    Json,
};
use clap::Parser;
use pog::pow::{
    crack::{BruteForceCracker, CrackerBackend, HashcatCracker},
    solver::SolverService,
    Challenge,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{classify::ServerErrorsFailureClass, trace::TraceLayer};
use tracing::{info_span, Span};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod job_manager;
use job_manager::{JobError, JobStatus};

#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// the address to listen to http job requests on.
    #[arg(short, long, default_value = "0.0.0.0:3000", env = "SOLVER_BIND_ADDRESS")]
    bind_address: String,

    /// path to the hashcat binary.
    #[arg(long, default_value = "hashcat", env = "SOLVER_HASHCAT_PATH")]
    hashcat_path: PathBuf,

    /// hashcat workload profile (1-4).
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=4))]
    workload_profile: u8,

    /// extra options passed to hashcat as is.
    #[arg(long, allow_hyphen_values = true, value_delimiter = ' ')]
    hashcat_options: Vec<String>,

    /// the number of challenges solved at the same time.
    #[arg(long, default_value_t = 1, env = "SOLVER_MAX_CONCURRENT")]
    max_concurrent: usize,

    /// seconds a challenge may take, including the time spent waiting for a slot.
    #[arg(long, default_value_t = 30, env = "SOLVER_TIMEOUT")]
    timeout: u64,

    /// skip hashcat and search on the CPU.
    #[arg(long, default_value = "false")]
    cpu: bool,

    /// the number of threads for the CPU search. `0` means use all cores.
    #[arg(long, default_value = "0")]
    cores: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    LogTracer::init()?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let threads = (args.cores > 0).then_some(args.cores);
    let backend = if args.cpu {
        CrackerBackend::BruteForce(BruteForceCracker::new(threads))
    } else {
        match CrackerBackend::detect(HashcatCracker::new(
            args.hashcat_path,
            args.workload_profile,
            args.hashcat_options,
        )) {
            CrackerBackend::BruteForce(_) => CrackerBackend::BruteForce(BruteForceCracker::new(threads)),
            hashcat => hashcat,
        }
    };
    let solver = SolverService::new(
        Arc::new(backend),
        args.max_concurrent,
        Duration::from_secs(args.timeout),
    );
    let job_manager = Arc::new(job_manager::JobManager::new(Arc::new(solver)));
    let router = router(job_manager);
    tracing::info!(
        "starting http server with bind address: {}",
        args.bind_address
    );
    let listener = tokio::net::TcpListener::bind(args.bind_address).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn router<T: GetOrCreate + Send + Sync + 'static>(job_manager: Arc<T>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/job", post(post_job::<T>))
        .with_state(job_manager)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let matched_path = request.uri().to_string();

                    info_span!(
                        "http_request",
                        method = ?request.method(),
                        uri =  matched_path,
                        status = tracing::field::Empty,
                        error = tracing::field::Empty,
                    )
                })
                .on_response(|response: &Response, _latency: Duration, span: &Span| {
                    span.record("status", response.status().as_str());
                    tracing::info!("served request");
                })
                .on_failure(
                    |error: ServerErrorsFailureClass, _latency: Duration, span: &Span| {
                        match error {
                            ServerErrorsFailureClass::StatusCode(code) => {
                                span.record("status", code.as_str());
                            }
                            ServerErrorsFailureClass::Error(err) => {
                                span.record("error", err.as_str());
                            }
                        }
                        tracing::error!("request fail");
                    },
                ),
        )
}

const ROOT_RESPONSE: &str = "{ 'message': 'ok' }";
async fn root() -> impl IntoResponse {
    ROOT_RESPONSE
}

async fn post_job<T: GetOrCreate>(
    State(manager): State<Arc<T>>,
    Json(challenge): Json<Challenge>,
) -> Result<JobStatus, JobError> {
    manager.get_or_create(challenge)
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        match self {
            JobError::TooManyJobs => (StatusCode::TOO_MANY_REQUESTS, "").into_response(),
            JobError::InvalidChallenge(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response(),
        }
    }
}

impl IntoResponse for JobStatus {
    fn into_response(self) -> Response {
        match self {
            JobStatus::Created => (StatusCode::CREATED, "").into_response(),
            JobStatus::InProgress => (StatusCode::CREATED, "").into_response(),
            JobStatus::Done(result) => (StatusCode::OK, Json(result)).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::job_manager::{self, JobError, JobStatus};
    use super::router;
    use axum_test::TestServer;
    use mockall::predicate::eq;
    use pog::pow::{Challenge, ChallengeResult, HashMode};
    use std::sync::Arc;

    fn challenge() -> Challenge {
        Challenge {
            hash: "$BLAKE2$00".into(),
            salt: "0011223344556677".into(),
            mode: HashMode::Blake2b,
            chars: "0123456789".into(),
            mask: "?1?1?1?1?1?1?1".into(),
            difficulty: 7,
        }
    }

    #[tokio::test]
    async fn test_root() {
        let mut mock_manager = job_manager::MockGetOrCreate::new();
        mock_manager.expect_get_or_create().times(0);
        let router = router(Arc::new(mock_manager));
        let server = TestServer::new(router).unwrap();
        let response = server.get("/").await;
        assert_eq!(response.text(), super::ROOT_RESPONSE);
    }

    #[tokio::test]
    async fn test_post_job_created() {
        let mut mock_manager = job_manager::MockGetOrCreate::new();
        mock_manager
            .expect_get_or_create()
            .with(eq(challenge()))
            .times(2)
            .returning(|_| Ok(JobStatus::Created));
        let router = router(Arc::new(mock_manager));
        let server = TestServer::new(router).unwrap();
        let response = server.post("/job").json(&challenge()).await;
        assert_eq!(response.status_code(), axum::http::StatusCode::CREATED);

        // requesting the same is idempotent
        let response = server.post("/job").json(&challenge()).await;
        assert_eq!(response.status_code(), axum::http::StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_post_job_done() {
        let result = ChallengeResult {
            password: Some("1234567".into()),
            elapsed_time: 1.5,
            error: None,
        };
        let expected = result.clone();

        let mut mock_manager = job_manager::MockGetOrCreate::new();
        mock_manager
            .expect_get_or_create()
            .with(eq(challenge()))
            .times(1)
            .returning(move |_| Ok(JobStatus::Done(result.clone())));
        let router = router(Arc::new(mock_manager));
        let server = TestServer::new(router).unwrap();
        let response = server.post("/job").json(&challenge()).await;
        assert_eq!(response.status_code(), axum::http::StatusCode::OK);
        assert_eq!(response.json::<ChallengeResult>(), expected);
    }

    #[tokio::test]
    async fn test_post_job_too_many() {
        let mut mock_manager = job_manager::MockGetOrCreate::new();
        mock_manager
            .expect_get_or_create()
            .times(1)
            .returning(|_| Err(JobError::TooManyJobs));
        let router = router(Arc::new(mock_manager));
        let server = TestServer::new(router).unwrap();
        let response = server.post("/job").json(&challenge()).await;
        assert_eq!(
            response.status_code(),
            axum::http::StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_post_job_invalid() {
        let mut mock_manager = job_manager::MockGetOrCreate::new();
        mock_manager
            .expect_get_or_create()
            .times(1)
            .returning(|_| Err(JobError::InvalidChallenge("empty charset".into())));
        let router = router(Arc::new(mock_manager));
        let server = TestServer::new(router).unwrap();
        let response = server.post("/job").json(&challenge()).await;
        assert_eq!(
            response.status_code(),
            axum::http::StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(response.text(), "empty charset");

        // bodies that aren't challenges never reach the manager
        let response = server
            .post("/job")
            .json(&serde_json::json!({"challenge_hash": "x"}))
            .await;
        assert_eq!(
            response.status_code(),
            axum::http::StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
