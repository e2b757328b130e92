//! Wire protocol between the host and the script runner subprocess.
//!
//! Newline-delimited JSON over the child's stdio. The host writes one
//! [`RunnerInit`] line, then answers each capability call with a
//! [`CallResponse`] line. The child emits [`RunnerMessage`] lines: logs,
//! capability calls, and exactly one terminal `result` or `error`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::log::LogLevel;

/// First line written to the runner: the event object, the script source,
/// and the names of the secrets available to this run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInit {
    pub event: RunnerEvent,
    pub source: String,
    pub secret_names: Vec<String>,
}

/// The event object the script's entry point is invoked with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    pub organization_id: String,
    pub task_id: String,
}

/// A message emitted by the runner, one per stdout line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// A console line emitted by the script.
    Log { level: LogLevel, message: String },
    /// A mediated capability call awaiting a [`CallResponse`].
    Call {
        id: u64,
        capability: String,
        params: Value,
    },
    /// Terminal: the script's classified output value.
    Result { output: Value },
    /// Terminal: the script threw or the runner could not resolve an entry
    /// point.
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

/// Parse one runner stdout line.
pub fn parse_runner_line(line: &str) -> Result<RunnerMessage, serde_json::Error> {
    serde_json::from_str(line)
}

/// Host answer to a capability call.
#[derive(Debug, Clone, Serialize)]
pub struct CallResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResponse {
    pub fn ok(id: u64, value: Value) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability call payloads
// ---------------------------------------------------------------------------

/// Parameters of a `secret.get` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretGetParams {
    pub organization_id: String,
    pub name: String,
}

/// Parameters of an `http.request` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpCallParams {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Result of an `http.request` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpCallResult {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Parameters of an `html.select` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlSelectParams {
    pub html: String,
    pub selector: String,
    #[serde(default)]
    pub attr: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
