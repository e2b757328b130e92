//! Queue/retry controller.
//!
//! Polls for pending automation runs and dispatches them onto a bounded
//! pool: a deployment-wide semaphore caps concurrent executions, and each
//! claimed run gets up to three attempts, spending retries only on
//! infrastructure failures. Uses `FOR UPDATE SKIP LOCKED` claiming via
//! [`RunRepo::claim_next`] so concurrent workers never double-dispatch.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use pact_core::identity::ExecutionRequest;
use pact_core::types::DbId;
use pact_db::models::run::{AutomationRun, RunOutcome};
use pact_db::repositories::RunRepo;
use pact_engine::executor::{ExecutionHost, ExecutionReport, RunState};

/// Total attempts for one claimed run (initial + retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff before retry attempts (exponential: 1 s, 2 s).
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

/// Default polling interval for the dispatcher loop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Background run dispatcher.
///
/// A single long-lived Tokio task that claims pending runs and spawns one
/// execution task per run, bounded by the concurrency semaphore.
pub struct RunDispatcher {
    pool: PgPool,
    engine: Arc<ExecutionHost>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl RunDispatcher {
    /// Create a dispatcher with the default 1-second poll interval.
    pub fn new(pool: PgPool, engine: Arc<ExecutionHost>, max_concurrent_runs: usize) -> Self {
        Self {
            pool,
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent_runs)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Run the dispatcher loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_concurrent_runs = self.permits.available_permits(),
            "Run dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Run dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.try_dispatch().await {
                        tracing::error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }
    }

    /// One dispatch cycle: claim pending runs while capacity remains.
    async fn try_dispatch(&self) -> Result<(), sqlx::Error> {
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return Ok(());
            };

            let Some(run) = RunRepo::claim_next(&self.pool).await? else {
                return Ok(());
            };

            tracing::info!(
                run_id = run.id,
                organization_id = %run.organization_id,
                task_id = %run.task_id,
                "Run claimed",
            );

            let pool = self.pool.clone();
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let _permit = permit;
                process_run(pool, engine, run).await;
            });
        }
    }
}

/// Execute one claimed run with retry and record its outcome.
async fn process_run(pool: PgPool, engine: Arc<ExecutionHost>, run: AutomationRun) {
    let request = match ExecutionRequest::new(
        run.organization_id.clone(),
        run.task_id.clone(),
        run.sandbox_id.clone(),
    ) {
        Ok(request) => request,
        Err(err) => {
            record_invalid(&pool, run.id, &err.to_string()).await;
            return;
        }
    };

    let (report, attempt) = execute_with_retry(&engine, &request).await;
    record_outcome(&pool, run.id, attempt, &report).await;
}

/// Execute up to [`MAX_ATTEMPTS`] times, spending retries only on
/// retryable failures. Each attempt is a fresh run: no state carries over.
pub async fn execute_with_retry(
    engine: &ExecutionHost,
    request: &ExecutionRequest,
) -> (ExecutionReport, u32) {
    let mut attempt: u32 = 1;
    loop {
        let report = engine.execute(request).await;

        let retryable = report
            .failure
            .map(|kind| kind.is_retryable())
            .unwrap_or(false);
        if !retryable || attempt >= MAX_ATTEMPTS {
            return (report, attempt);
        }

        let delay = RETRY_DELAYS[(attempt as usize - 1).min(RETRY_DELAYS.len() - 1)];
        tracing::warn!(
            attempt,
            organization_id = %request.organization_id,
            task_id = %request.task_id,
            delay_ms = delay.as_millis() as u64,
            "Run attempt failed with a retryable error; retrying",
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Persist the terminal state of a run. Best-effort: the execution result
/// stands even if recording fails.
async fn record_outcome(pool: &PgPool, id: DbId, attempt: u32, report: &ExecutionReport) {
    let outcome = RunOutcome {
        attempt: attempt as i16,
        output: report.result.output.clone(),
        error_message: report.result.error.clone(),
        logs: serde_json::json!(report.result.rendered_logs()),
        summary: report.result.summary.clone(),
        source_hash: report.source_hash.clone(),
        duration_ms: report.duration_ms.min(i32::MAX as u64) as i32,
    };

    let written = match report.final_state {
        RunState::Completed => RunRepo::complete(pool, id, &outcome).await,
        RunState::TimedOut => RunRepo::timeout(pool, id, &outcome).await,
        _ => RunRepo::fail(pool, id, &outcome).await,
    };

    if let Err(err) = written {
        tracing::warn!(run_id = id, error = %err, "Failed to record run outcome");
    }
}

/// Record a run whose stored identifiers no longer validate.
async fn record_invalid(pool: &PgPool, id: DbId, error: &str) {
    let outcome = RunOutcome {
        attempt: 1,
        output: None,
        error_message: Some(error.to_string()),
        logs: serde_json::json!([]),
        summary: None,
        source_hash: None,
        duration_ms: 0,
    };

    if let Err(err) = RunRepo::fail(pool, id, &outcome).await {
        tracing::warn!(run_id = id, error = %err, "Failed to record invalid run");
    }
}
