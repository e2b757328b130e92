//! The execution host: one request in, one well-formed result out.
//!
//! Drives the run lifecycle `Idle → Loading → ContextBuilding → Running →
//! {Completed, Failed, TimedOut}`:
//! 1. Load the script source (missing source is fatal for the run).
//! 2. Batch-fetch the organization's secrets (failure degrades to an
//!    empty batch; the run proceeds).
//! 3. Build the capability context and the per-run host.
//! 4. Run the sandboxed script against the fixed deadline.
//! 5. Classify the outcome and request a best-effort summary.
//!
//! No internal error escapes to the caller: every path ends in an
//! [`ExecutionReport`], worst case `success: false` with an error string.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use pact_core::automation::capability::{
    CapabilityContext, EXECUTION_DEADLINE, HTTP_REQUEST_TIMEOUT,
};
use pact_core::automation::log::{LogCollector, LogEntry, LogLevel};
use pact_core::automation::outcome::{ExecutionResult, TIMEOUT_MESSAGE};
use pact_core::automation::sandbox::{RunError, ScriptRunner};
use pact_core::identity::ExecutionRequest;

use crate::host::EngineCapabilityHost;
use crate::secrets::{RunSecrets, SecretAccessor};
use crate::source::{SourceError, SourceStore};
use crate::summary::{Summarizer, SUMMARY_LOG_TAIL};

/// Lifecycle states of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    ContextBuilding,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl RunState {
    /// The `System` log line appended when this state is entered.
    fn milestone(self) -> &'static str {
        match self {
            Self::Idle => "run created",
            Self::Loading => "loading script source",
            Self::ContextBuilding => "building capability context",
            Self::Running => "executing script",
            Self::Completed => "script completed",
            Self::Failed => "script failed",
            Self::TimedOut => "script timed out",
        }
    }
}

/// What made a run fail, for queue-level retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No script source exists for the request. Deterministic.
    SourceMissing,
    /// The stored source is unusable. Deterministic.
    SourceInvalid,
    /// The script store could not be reached. Infrastructure.
    SourceUnavailable,
    /// The runner process failed to start or broke down. Infrastructure.
    Runner,
    /// The script threw. Deterministic: a retry would fail identically.
    Script,
    /// The deadline elapsed.
    Timeout,
}

impl FailureKind {
    /// Whether the queue should spend a retry attempt on this failure.
    ///
    /// Only infrastructure failures are retryable; script bugs, missing
    /// sources, and timeouts fail identically on every attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::SourceUnavailable | Self::Runner)
    }
}

/// The outcome of one execution attempt.
#[derive(Debug)]
pub struct ExecutionReport {
    /// The caller-facing result.
    pub result: ExecutionResult,
    /// `None` on success; the failure class otherwise.
    pub failure: Option<FailureKind>,
    /// Terminal lifecycle state.
    pub final_state: RunState,
    /// SHA-256 hex digest of the executed source, when it was loaded.
    pub source_hash: Option<String>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
}

/// Executes automation scripts for requests.
pub struct ExecutionHost {
    sources: Arc<dyn SourceStore>,
    secrets: Arc<SecretAccessor>,
    summarizer: Option<Arc<dyn Summarizer>>,
    runner: ScriptRunner,
    http: reqwest::Client,
    deadline: Duration,
}

impl ExecutionHost {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        secrets: Arc<SecretAccessor>,
        summarizer: Option<Arc<dyn Summarizer>>,
        runner: ScriptRunner,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest HTTP client");

        Self {
            sources,
            secrets,
            summarizer,
            runner,
            http,
            deadline: EXECUTION_DEADLINE,
        }
    }

    #[cfg(test)]
    fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Execute one request to completion.
    ///
    /// Always resolves with a report; never panics or propagates internal
    /// errors. The engine is stateless across calls: every run gets a
    /// fresh secret batch, capability context, and runner process.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut logs = LogCollector::new();
        let mut state = RunState::Idle;

        tracing::info!(
            %run_id,
            organization_id = %request.organization_id,
            task_id = %request.task_id,
            "automation run starting"
        );

        // Loading.
        enter(&mut state, RunState::Loading, &mut logs);
        let source = match self.sources.load(request).await {
            Ok(source) => source,
            Err(err) => {
                let kind = match &err {
                    SourceError::NotFound { .. } => FailureKind::SourceMissing,
                    SourceError::Invalid(_) => FailureKind::SourceInvalid,
                    SourceError::Unavailable(_) => FailureKind::SourceUnavailable,
                };
                logs.append(LogLevel::System, err.to_string());
                enter(&mut state, RunState::Failed, &mut logs);
                return self
                    .finish_failure(kind, err.to_string(), logs, None, started)
                    .await;
            }
        };
        let source_hash = Some(source_fingerprint(&source));

        let batch = match self.secrets.fetch_for_run(&request.organization_id).await {
            Ok(batch) => batch,
            Err(err) => {
                // Secret resolution trouble never fails a run; lookups
                // will resolve to null instead.
                tracing::warn!(%run_id, error = %err, "secret fetch failed; run proceeds without secrets");
                logs.append(
                    LogLevel::System,
                    format!("secrets unavailable for this run: {err}"),
                );
                RunSecrets::empty(&request.organization_id)
            }
        };

        // ContextBuilding.
        enter(&mut state, RunState::ContextBuilding, &mut logs);
        let context = CapabilityContext::build(request, batch.names());
        logs.append(
            LogLevel::System,
            format!(
                "capability context ready ({} secrets available)",
                context.secret_names().len()
            ),
        );
        let host = EngineCapabilityHost::new(Arc::clone(&self.secrets), batch, self.http.clone());

        // Running.
        enter(&mut state, RunState::Running, &mut logs);
        match self
            .runner
            .run(&context, &source, &host, &mut logs, self.deadline)
            .await
        {
            Ok(output) => {
                enter(&mut state, RunState::Completed, &mut logs);
                let mut result = ExecutionResult::completed(output, logs.into_entries());
                let subject = result
                    .output
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string());
                result.summary = self.summarize(&subject, &result.logs).await;

                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(%run_id, duration_ms, "automation run completed");

                ExecutionReport {
                    result,
                    failure: None,
                    final_state: RunState::Completed,
                    source_hash,
                    duration_ms,
                }
            }
            Err(RunError::Timeout { elapsed_ms }) => {
                tracing::warn!(%run_id, elapsed_ms, "automation run exceeded its deadline");
                enter(&mut state, RunState::TimedOut, &mut logs);
                self.finish_failure(
                    FailureKind::Timeout,
                    TIMEOUT_MESSAGE.to_string(),
                    logs,
                    source_hash,
                    started,
                )
                .await
            }
            Err(RunError::Script { message, stack }) => {
                let mut detail = format!("script error: {message}");
                if let Some(stack) = &stack {
                    detail.push('\n');
                    detail.push_str(stack);
                }
                logs.append(LogLevel::Error, detail);
                enter(&mut state, RunState::Failed, &mut logs);
                self.finish_failure(FailureKind::Script, message, logs, source_hash, started)
                    .await
            }
            Err(err @ (RunError::Spawn(_) | RunError::Runner(_))) => {
                tracing::error!(%run_id, error = %err, "script runner failed");
                enter(&mut state, RunState::Failed, &mut logs);
                self.finish_failure(
                    FailureKind::Runner,
                    err.to_string(),
                    logs,
                    source_hash,
                    started,
                )
                .await
            }
        }
    }

    async fn finish_failure(
        &self,
        kind: FailureKind,
        error: String,
        logs: LogCollector,
        source_hash: Option<String>,
        started: Instant,
    ) -> ExecutionReport {
        let final_state = if kind == FailureKind::Timeout {
            RunState::TimedOut
        } else {
            RunState::Failed
        };

        let mut result = ExecutionResult::failed(error, logs.into_entries());
        let subject = result.error.clone().unwrap_or_default();
        result.summary = self.summarize(&subject, &result.logs).await;

        ExecutionReport {
            result,
            failure: Some(kind),
            final_state,
            source_hash,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Best-effort summary request; every failure is swallowed.
    async fn summarize(&self, subject: &str, logs: &[LogEntry]) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;

        let start = logs.len().saturating_sub(SUMMARY_LOG_TAIL);
        let tail: Vec<String> = logs[start..].iter().map(LogEntry::render).collect();

        match summarizer.summarize(subject, &tail).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                tracing::warn!(error = %err, "summarizer unavailable; omitting summary");
                None
            }
        }
    }
}

/// Transition into `next`, appending its `System` milestone line.
fn enter(state: &mut RunState, next: RunState, logs: &mut LogCollector) {
    *state = next;
    logs.append(LogLevel::System, next.milestone());
}

/// SHA-256 hex fingerprint tying a run record to the exact source it ran.
fn source_fingerprint(source: &str) -> String {
    let hash = Sha256::digest(source.as_bytes());
    format!("{hash:x}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use base64::Engine as _;

    use pact_core::types::DbId;
    use pact_db::models::secret::SecretRecord;

    use crate::secrets::{SecretCipher, SecretStore, SECRET_KEY_BYTES};
    use crate::source::LocalSourceStore;
    use crate::summary::SummarizerError;

    use super::*;

    fn node_available() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("org_1", "t_1", None).expect("valid request")
    }

    fn test_cipher() -> SecretCipher {
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; SECRET_KEY_BYTES]);
        SecretCipher::from_base64(&key).expect("cipher")
    }

    struct InMemorySecretStore {
        records: Vec<SecretRecord>,
    }

    #[async_trait]
    impl SecretStore for InMemorySecretStore {
        async fn list_for_organization(
            &self,
            organization_id: &str,
        ) -> Result<Vec<SecretRecord>, sqlx::Error> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.organization_id == organization_id)
                .cloned()
                .collect())
        }

        async fn touch_last_used(&self, _id: DbId) -> Result<(), sqlx::Error> {
            Ok(())
        }
    }

    /// Summarizer double: either always fails or returns a fixed string.
    struct FixedSummarizer {
        response: Option<String>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(
            &self,
            _subject: &str,
            _log_tail: &[String],
        ) -> Result<String, SummarizerError> {
            *self.calls.lock().expect("lock") += 1;
            match &self.response {
                Some(summary) => Ok(summary.clone()),
                None => Err(SummarizerError::HttpStatus(503)),
            }
        }
    }

    /// Write a script under the local layout and build a host around it.
    fn host_for_script(
        dir: &tempfile::TempDir,
        source: &str,
        records: Vec<SecretRecord>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> ExecutionHost {
        let org_dir = dir.path().join("org_1");
        std::fs::create_dir_all(&org_dir).expect("create org dir");
        std::fs::write(org_dir.join("t_1.automation.js"), source).expect("write script");

        let sources = Arc::new(LocalSourceStore::new(dir.path()));
        let accessor = Arc::new(SecretAccessor::new(
            Arc::new(InMemorySecretStore { records }),
            test_cipher(),
        ));
        ExecutionHost::new(sources, accessor, summarizer, ScriptRunner::default())
    }

    fn secret_record(name: &str, plaintext: &str) -> SecretRecord {
        let now = chrono::Utc::now();
        SecretRecord {
            id: 1,
            organization_id: "org_1".to_string(),
            name: name.to_string(),
            encrypted_value: test_cipher().encrypt(plaintext).expect("encrypt"),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    // -- End-to-end ----------------------------------------------------------

    #[tokio::test]
    async fn executes_the_basic_scenario() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let host = host_for_script(
            &dir,
            "module.exports = async (e) => ({ orgId: e.organizationId });",
            vec![],
            None,
        );

        let report = host.execute(&request()).await;

        assert!(report.result.success);
        assert_eq!(report.result.output.as_ref().expect("output")["orgId"], "org_1");
        assert!(report.failure.is_none());
        assert_eq!(report.final_state, RunState::Completed);
        assert!(report.source_hash.is_some());
        assert!(
            !report.result.logs.is_empty(),
            "lifecycle milestones should be logged"
        );
    }

    #[tokio::test]
    async fn every_lifecycle_state_leaves_a_system_log() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let host = host_for_script(&dir, "module.exports = () => 0;", vec![], None);

        let report = host.execute(&request()).await;
        let system: Vec<&str> = report
            .result
            .logs
            .iter()
            .filter(|e| e.level == LogLevel::System)
            .map(|e| e.message.as_str())
            .collect();

        for milestone in [
            "loading script source",
            "building capability context",
            "executing script",
            "script completed",
        ] {
            assert!(
                system.contains(&milestone),
                "missing milestone '{milestone}' in {system:?}"
            );
        }
    }

    #[tokio::test]
    async fn missing_script_is_fatal_and_not_retryable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sources = Arc::new(LocalSourceStore::new(dir.path()));
        let accessor = Arc::new(SecretAccessor::new(
            Arc::new(InMemorySecretStore { records: vec![] }),
            test_cipher(),
        ));
        let host = ExecutionHost::new(sources, accessor, None, ScriptRunner::default());

        let report = host.execute(&request()).await;

        assert!(!report.result.success);
        assert!(report
            .result
            .error
            .as_deref()
            .expect("error")
            .contains("not found"));
        assert_matches!(report.failure, Some(FailureKind::SourceMissing));
        assert!(!report.failure.expect("failure").is_retryable());
        assert_eq!(report.final_state, RunState::Failed);
    }

    #[tokio::test]
    async fn throwing_script_resolves_to_a_failed_result() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let host = host_for_script(&dir, "throw new Error('boom')", vec![], None);

        let report = host.execute(&request()).await;

        assert!(!report.result.success);
        assert_eq!(report.result.error.as_deref(), Some("boom"));
        assert_matches!(report.failure, Some(FailureKind::Script));
        assert!(!report.failure.expect("failure").is_retryable());
    }

    #[tokio::test]
    async fn over_deadline_run_times_out_with_fixed_message() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let host = host_for_script(
            &dir,
            "module.exports = () => new Promise(() => {});",
            vec![],
            None,
        )
        .with_deadline(Duration::from_millis(800));

        let report = host.execute(&request()).await;

        assert!(!report.result.success);
        assert_eq!(report.result.error.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_matches!(report.failure, Some(FailureKind::Timeout));
        assert_eq!(report.final_state, RunState::TimedOut);
    }

    #[tokio::test]
    async fn secrets_flow_end_to_end() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let host = host_for_script(
            &dir,
            "module.exports = async (e) => ({ \
                own: await getSecret(e.organizationId, 'portal_token'), \
                forged: await getSecret('org_2', 'portal_token'), \
                names: secretNames, \
            });",
            vec![secret_record("portal_token", "tok-123")],
            None,
        );

        let report = host.execute(&request()).await;
        let output = report.result.output.as_ref().expect("output");

        assert_eq!(output["own"], "tok-123");
        assert_eq!(output["forged"], serde_json::Value::Null);
        assert_eq!(output["names"], serde_json::json!(["portal_token"]));
    }

    // -- Summarizer boundary -------------------------------------------------

    #[tokio::test]
    async fn failing_summarizer_never_flips_success() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let summarizer = Arc::new(FixedSummarizer {
            response: None,
            calls: Mutex::new(0),
        });
        let host = host_for_script(
            &dir,
            "module.exports = () => ({ done: true });",
            vec![],
            Some(Arc::clone(&summarizer) as Arc<dyn Summarizer>),
        );

        let report = host.execute(&request()).await;

        assert!(report.result.success);
        assert!(report.result.summary.is_none());
        assert_eq!(*summarizer.calls.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn working_summarizer_attaches_a_summary() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let summarizer = Arc::new(FixedSummarizer {
            response: Some("The script completed successfully.".to_string()),
            calls: Mutex::new(0),
        });
        let host = host_for_script(
            &dir,
            "module.exports = () => ({ done: true });",
            vec![],
            Some(summarizer as Arc<dyn Summarizer>),
        );

        let report = host.execute(&request()).await;

        assert_eq!(
            report.result.summary.as_deref(),
            Some("The script completed successfully.")
        );
    }

    #[tokio::test]
    async fn failed_runs_still_request_a_summary() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let dir = tempfile::tempdir().expect("temp dir");
        let summarizer = Arc::new(FixedSummarizer {
            response: Some("The script threw an error.".to_string()),
            calls: Mutex::new(0),
        });
        let host = host_for_script(
            &dir,
            "throw new Error('nope')",
            vec![],
            Some(summarizer as Arc<dyn Summarizer>),
        );

        let report = host.execute(&request()).await;

        assert!(!report.result.success);
        assert_eq!(
            report.result.summary.as_deref(),
            Some("The script threw an error.")
        );
    }

    // -- Retry classification ------------------------------------------------

    #[test]
    fn source_fingerprint_is_a_stable_hex_digest() {
        let a = source_fingerprint("module.exports = 1;");
        let b = source_fingerprint("module.exports = 1;");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, source_fingerprint("module.exports = 2;"));
    }

    #[test]
    fn only_infrastructure_failures_are_retryable() {
        assert!(FailureKind::SourceUnavailable.is_retryable());
        assert!(FailureKind::Runner.is_retryable());
        assert!(!FailureKind::SourceMissing.is_retryable());
        assert!(!FailureKind::SourceInvalid.is_retryable());
        assert!(!FailureKind::Script.is_retryable());
        assert!(!FailureKind::Timeout.is_retryable());
    }
}
