//! Terminal run artifacts and the stable caller-facing response shape.

use serde::Serialize;
use serde_json::Value;

use super::log::LogEntry;

/// Fixed error message reported when a run exceeds its deadline.
pub const TIMEOUT_MESSAGE: &str = "Script execution timed out after 5 minutes";

/// The terminal artifact of one run. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub summary: Option<String>,
}

impl ExecutionResult {
    /// A run that returned normally within budget.
    pub fn completed(output: Value, logs: Vec<LogEntry>) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            logs,
            summary: None,
        }
    }

    /// A run that threw, timed out, or could not be started.
    pub fn failed(error: impl Into<String>, logs: Vec<LogEntry>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            logs,
            summary: None,
        }
    }

    /// Log lines in the rendered `"[LEVEL] message"` form.
    pub fn rendered_logs(&self) -> Vec<String> {
        self.logs.iter().map(LogEntry::render).collect()
    }

    /// Convert into the stable response contract downstream callers
    /// (scheduler, UI) depend on.
    pub fn to_response(&self) -> ExecutionResponse {
        ExecutionResponse {
            success: self.success,
            output: self.output.clone(),
            error: self.error.clone(),
            logs: self.rendered_logs(),
            summary: self.summary.clone(),
        }
    }
}

/// The stable serialized result shape:
/// `{ success, output?, error?, logs: string[], summary? }`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
