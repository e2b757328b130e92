//! Subprocess sandbox for script execution.
//!
//! Each run spawns a fresh Node process on the embedded harness with a
//! cleared environment and piped stdio, writes the init line, then pumps
//! runner messages: script log lines go to the run's [`LogCollector`],
//! capability calls are policy-checked and dispatched to the
//! [`CapabilityHost`], and the first terminal message settles the run.
//!
//! The whole pump is raced against the run deadline. `kill_on_drop(true)`
//! means an elapsed deadline hard-kills the child; the engine stops more
//! than just waiting for it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::capability::{
    http_method_allowed, CapabilityContext, CapabilityHost, SecretResolution,
    MAX_HTTP_REQUESTS_PER_RUN, MAX_HTTP_REQUEST_BYTES,
};
use super::log::{LogCollector, LogLevel};
use super::protocol::{
    parse_runner_line, CallResponse, HtmlSelectParams, HttpCallParams, RunnerEvent, RunnerInit,
    RunnerMessage, SecretGetParams,
};

/// The embedded Node harness that hosts one script evaluation.
const HARNESS_SOURCE: &str = include_str!("harness.js");

/// Maximum stderr captured per run for diagnostics (64 KiB).
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Errors surfaced by one sandboxed run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The runner process could not be started.
    #[error("failed to spawn script runner: {0}")]
    Spawn(std::io::Error),

    /// The run deadline elapsed and the runner was killed.
    #[error("script execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The script threw, or no callable entry point could be resolved.
    #[error("script error: {message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    /// The runner itself failed (I/O breakdown, premature exit).
    #[error("script runner failed: {0}")]
    Runner(String),
}

/// Spawns and drives script runner subprocesses.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    node_binary: String,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new("node")
    }
}

impl ScriptRunner {
    pub fn new(node_binary: impl Into<String>) -> Self {
        Self {
            node_binary: node_binary.into(),
        }
    }

    /// Execute `source` inside a fresh runner, mediating capability calls
    /// through `host` and appending script output to `logs`.
    ///
    /// Returns the script's classified output value, or the first error.
    /// On timeout the child is killed via `kill_on_drop`; log entries
    /// collected up to that point are preserved.
    pub async fn run(
        &self,
        context: &CapabilityContext,
        source: &str,
        host: &dyn CapabilityHost,
        logs: &mut LogCollector,
        deadline: Duration,
    ) -> Result<Value, RunError> {
        let started = Instant::now();

        let mut child = Command::new(&self.node_binary)
            .arg("--no-addons")
            .arg("-e")
            .arg(HARNESS_SOURCE)
            .env_clear()
            // PATH survives so the runner binary resolves; everything else
            // (credentials, cloud config) stays out of the child.
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("NODE_NO_WARNINGS", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Spawn)?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move { read_capped(stderr).await });

        let init = RunnerInit {
            event: RunnerEvent {
                organization_id: context.organization_id().to_string(),
                task_id: context.task_id().to_string(),
            },
            source: source.to_string(),
            secret_names: context.secret_names().to_vec(),
        };

        match tokio::time::timeout(deadline, drive(child, init, context, host, logs, stderr_task))
            .await
        {
            Ok(result) => result,
            // `child` is owned by the cancelled future, so the timeout drop
            // kills the process.
            Err(_elapsed) => Err(RunError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

/// Pump runner messages until a terminal message or stdout EOF.
async fn drive(
    mut child: Child,
    init: RunnerInit,
    context: &CapabilityContext,
    host: &dyn CapabilityHost,
    logs: &mut LogCollector,
    stderr_task: JoinHandle<Vec<u8>>,
) -> Result<Value, RunError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| RunError::Runner("runner stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunError::Runner("runner stdout unavailable".to_string()))?;

    let mut encoded = serde_json::to_string(&init)
        .map_err(|e| RunError::Runner(format!("failed to encode runner init: {e}")))?;
    encoded.push('\n');
    stdin
        .write_all(encoded.as_bytes())
        .await
        .map_err(|e| RunError::Runner(format!("failed to write to runner: {e}")))?;

    let mut lines = BufReader::new(stdout).lines();
    let mut http_requests: u32 = 0;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| RunError::Runner(format!("failed to read runner output: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let msg = match parse_runner_line(&line) {
            Ok(msg) => msg,
            // Stray non-protocol output still shows up in the run log.
            Err(_) => {
                logs.append(LogLevel::Log, line);
                continue;
            }
        };

        match msg {
            RunnerMessage::Log { level, message } => logs.append(level, message),
            RunnerMessage::Call {
                id,
                capability,
                params,
            } => {
                let response =
                    service_call(host, context, logs, &mut http_requests, id, &capability, params)
                        .await;
                let mut encoded = serde_json::to_string(&response)
                    .map_err(|e| RunError::Runner(format!("failed to encode response: {e}")))?;
                encoded.push('\n');
                stdin
                    .write_all(encoded.as_bytes())
                    .await
                    .map_err(|e| RunError::Runner(format!("failed to write to runner: {e}")))?;
            }
            RunnerMessage::Result { output } => {
                drop(stdin);
                let _ = child.wait().await;
                return Ok(output);
            }
            RunnerMessage::Error { message, stack } => {
                drop(stdin);
                let _ = child.wait().await;
                return Err(RunError::Script { message, stack });
            }
        }
    }

    // stdout closed without a terminal message: the runner died on us.
    drop(stdin);
    let status = child
        .wait()
        .await
        .map_err(|e| RunError::Runner(format!("failed to reap runner: {e}")))?;
    let stderr = stderr_task.await.unwrap_or_default();
    let detail = String::from_utf8_lossy(&stderr);
    let detail = detail.trim();

    Err(RunError::Runner(if detail.is_empty() {
        format!("runner exited with {status} before producing a result")
    } else {
        format!("runner exited with {status} before producing a result: {detail}")
    }))
}

/// Policy-check and dispatch one capability call.
///
/// Organization re-validation, the per-run HTTP budget, and request size
/// caps are enforced here so every [`CapabilityHost`] implementation gets
/// them for free.
async fn service_call(
    host: &dyn CapabilityHost,
    context: &CapabilityContext,
    logs: &mut LogCollector,
    http_requests: &mut u32,
    id: u64,
    capability: &str,
    params: Value,
) -> CallResponse {
    match capability {
        "secret.get" => {
            let Ok(params) = serde_json::from_value::<SecretGetParams>(params) else {
                return CallResponse::err(id, "invalid parameters for secret.get");
            };

            if !context.authorizes_secret_access(&params.organization_id) {
                logs.append(
                    LogLevel::System,
                    format!(
                        "secret access denied: organization mismatch for '{}'",
                        params.name
                    ),
                );
                return CallResponse::ok(id, Value::Null);
            }

            match host.secret_get(context, &params.name).await {
                SecretResolution::Resolved(value) => CallResponse::ok(id, Value::String(value)),
                SecretResolution::Denied => {
                    logs.append(
                        LogLevel::System,
                        format!("secret access denied for '{}'", params.name),
                    );
                    CallResponse::ok(id, Value::Null)
                }
                SecretResolution::NotFound => {
                    logs.append(
                        LogLevel::System,
                        format!("secret '{}' not found", params.name),
                    );
                    CallResponse::ok(id, Value::Null)
                }
                SecretResolution::Undecryptable => {
                    logs.append(
                        LogLevel::System,
                        format!("secret '{}' could not be decrypted", params.name),
                    );
                    CallResponse::ok(id, Value::Null)
                }
            }
        }
        "http.request" => {
            *http_requests += 1;
            if *http_requests > MAX_HTTP_REQUESTS_PER_RUN {
                return CallResponse::err(
                    id,
                    format!("http request budget exceeded ({MAX_HTTP_REQUESTS_PER_RUN} per run)"),
                );
            }

            let Ok(params) = serde_json::from_value::<HttpCallParams>(params) else {
                return CallResponse::err(id, "invalid parameters for http.request");
            };
            if !http_method_allowed(&params.method) {
                return CallResponse::err(id, format!("http method not allowed: {}", params.method));
            }
            if params.body.as_ref().map(String::len).unwrap_or(0) > MAX_HTTP_REQUEST_BYTES {
                return CallResponse::err(
                    id,
                    format!("request body too large (max {MAX_HTTP_REQUEST_BYTES} bytes)"),
                );
            }

            match host.http_request(context, &params).await {
                Ok(result) => match serde_json::to_value(&result) {
                    Ok(value) => CallResponse::ok(id, value),
                    Err(e) => CallResponse::err(id, format!("failed to encode http response: {e}")),
                },
                Err(e) => CallResponse::err(id, e),
            }
        }
        "html.select" => {
            let Ok(params) = serde_json::from_value::<HtmlSelectParams>(params) else {
                return CallResponse::err(id, "invalid parameters for html.select");
            };
            match host.html_select(&params.html, &params.selector, params.attr.as_deref()) {
                Ok(matches) => match serde_json::to_value(matches) {
                    Ok(value) => CallResponse::ok(id, value),
                    Err(e) => CallResponse::err(id, format!("failed to encode matches: {e}")),
                },
                Err(e) => CallResponse::err(id, e),
            }
        }
        other => CallResponse::err(id, format!("unknown capability: {other}")),
    }
}

/// Read an output stream to EOF, retaining at most [`MAX_STDERR_BYTES`].
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_STDERR_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::super::capability::CapabilityContext;
    use super::super::log::{LogCollector, LogLevel};
    use super::super::test_helpers::{node_available, request, StaticHost};
    use super::*;

    const TEST_DEADLINE: Duration = Duration::from_secs(20);

    async fn run_script(
        source: &str,
        host: &StaticHost,
        secret_names: Vec<String>,
    ) -> (Result<Value, RunError>, LogCollector) {
        let runner = ScriptRunner::default();
        let context = CapabilityContext::build(&request(), secret_names);
        let mut logs = LogCollector::new();
        let result = runner
            .run(&context, source, host, &mut logs, TEST_DEADLINE)
            .await;
        (result, logs)
    }

    // -- Entry-point resolution (all four export shapes) -------------------

    #[tokio::test]
    async fn callable_module_export() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = async (event) => ({ v: 1, org: event.organizationId });",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        let output = result.expect("run");
        assert_eq!(output["v"], 1);
        assert_eq!(output["org"], "org_1");
    }

    #[tokio::test]
    async fn run_method_export() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = { run: (event) => ({ v: 1, org: event.organizationId }) };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        let output = result.expect("run");
        assert_eq!(output["v"], 1);
        assert_eq!(output["org"], "org_1");
    }

    #[tokio::test]
    async fn default_function_export() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = { default: async (event) => ({ v: 1, org: event.organizationId }) };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        let output = result.expect("run");
        assert_eq!(output["v"], 1);
        assert_eq!(output["org"], "org_1");
    }

    #[tokio::test]
    async fn plain_value_export() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = { v: 1, org: 'org_1' };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        let output = result.expect("run");
        assert_eq!(output["v"], 1);
        assert_eq!(output["org"], "org_1");
    }

    #[tokio::test]
    async fn top_level_value_without_exports() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script("({ answer: 42 })", &StaticHost::empty(), vec![]).await;
        assert_eq!(result.expect("run")["answer"], 42);
    }

    #[tokio::test]
    async fn callable_takes_precedence_over_run_property() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        // A callable with a `run` property must be invoked directly.
        let (result, _) = run_script(
            "const fn = () => 'called'; fn.run = () => 'ran'; module.exports = fn;",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        assert_eq!(result.expect("run"), "called");
    }

    // -- Failure classification --------------------------------------------

    #[tokio::test]
    async fn throwing_script_becomes_script_error() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) =
            run_script("throw new Error('boom')", &StaticHost::empty(), vec![]).await;
        assert_matches!(result, Err(RunError::Script { ref message, .. }) if message == "boom");
    }

    #[tokio::test]
    async fn rejecting_entry_point_becomes_script_error() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = async () => { throw new Error('async boom'); };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        assert_matches!(
            result,
            Err(RunError::Script { ref message, .. }) if message == "async boom"
        );
    }

    #[tokio::test]
    async fn never_settling_script_times_out() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let runner = ScriptRunner::default();
        let context = CapabilityContext::build(&request(), vec![]);
        let mut logs = LogCollector::new();
        let result = runner
            .run(
                &context,
                "module.exports = () => new Promise(() => {});",
                &StaticHost::empty(),
                &mut logs,
                Duration::from_millis(800),
            )
            .await;
        assert_matches!(result, Err(RunError::Timeout { elapsed_ms }) if elapsed_ms >= 800);
    }

    #[tokio::test]
    async fn missing_runner_binary_is_a_spawn_error() {
        let runner = ScriptRunner::new("definitely-not-a-real-node-binary");
        let context = CapabilityContext::build(&request(), vec![]);
        let mut logs = LogCollector::new();
        let result = runner
            .run(
                &context,
                "module.exports = 1;",
                &StaticHost::empty(),
                &mut logs,
                TEST_DEADLINE,
            )
            .await;
        assert_matches!(result, Err(RunError::Spawn(_)));
    }

    // -- Logging -------------------------------------------------------------

    #[tokio::test]
    async fn log_order_preserved_across_await() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, logs) = run_script(
            "module.exports = async () => { \
                console.log('a'); \
                await new Promise((resolve) => setTimeout(resolve, 10)); \
                console.log('b'); \
                return null; \
            };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        result.expect("run");

        let script_lines: Vec<&str> = logs
            .all()
            .iter()
            .filter(|e| e.level == LogLevel::Log)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(script_lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn console_levels_map_to_entry_levels() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, logs) = run_script(
            "module.exports = () => { \
                console.info('i'); console.warn('w'); console.error('e'); return 0; \
            };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        result.expect("run");

        let levels: Vec<LogLevel> = logs.all().iter().map(|e| e.level).collect();
        assert!(levels.contains(&LogLevel::Info));
        assert!(levels.contains(&LogLevel::Warn));
        assert!(levels.contains(&LogLevel::Error));
    }

    // -- Capability mediation -----------------------------------------------

    #[tokio::test]
    async fn secret_lookup_respects_organization() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let host = StaticHost::with_secret("api_token", "s3cr3t");
        let (result, logs) = run_script(
            "module.exports = async (event) => ({ \
                own: await getSecret(event.organizationId, 'api_token'), \
                forged: await getSecret('org_2', 'api_token'), \
            });",
            &host,
            vec!["api_token".to_string()],
        )
        .await;

        let output = result.expect("run");
        assert_eq!(output["own"], "s3cr3t");
        assert_eq!(output["forged"], Value::Null);

        assert!(
            logs.all().iter().any(|e| e.level == LogLevel::System
                && e.message.contains("organization mismatch")),
            "denied lookup should leave a system log line"
        );
    }

    #[tokio::test]
    async fn unknown_secret_resolves_to_null() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = async (event) => \
                ({ value: await getSecret(event.organizationId, 'nope') });",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        assert_eq!(result.expect("run")["value"], Value::Null);
    }

    #[tokio::test]
    async fn http_requests_are_mediated() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = async () => { \
                const res = await http.get('https://compliance.example/items'); \
                return { status: res.status }; \
            };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        assert_eq!(result.expect("run")["status"], 200);
    }

    #[tokio::test]
    async fn disallowed_http_method_rejects_the_call() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = async () => { \
                try { \
                    await http.request('TRACE', 'https://compliance.example/'); \
                    return 'allowed'; \
                } catch (err) { \
                    return err.message; \
                } \
            };",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        let output = result.expect("run");
        assert!(
            output.as_str().expect("string").contains("not allowed"),
            "unexpected output: {output}"
        );
    }

    #[tokio::test]
    async fn secret_names_are_visible_but_values_are_not() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let host = StaticHost::with_secret("api_token", "s3cr3t");
        let (result, _) = run_script(
            "module.exports = () => secretNames;",
            &host,
            vec!["api_token".to_string()],
        )
        .await;
        assert_eq!(result.expect("run"), serde_json::json!(["api_token"]));
    }

    #[tokio::test]
    async fn no_ambient_process_or_require() {
        if !node_available() {
            eprintln!("skipping: node not on PATH");
            return;
        }
        let (result, _) = run_script(
            "module.exports = () => [typeof process, typeof require];",
            &StaticHost::empty(),
            vec![],
        )
        .await;
        assert_eq!(
            result.expect("run"),
            serde_json::json!(["undefined", "undefined"])
        );
    }
}
