//! Automation run records.
//!
//! One row per dispatched execution request. The queue controller claims
//! pending rows, the engine executes, and the final state plus full output
//! capture is written back.

use serde::Serialize;
use sqlx::FromRow;

use pact_core::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Status values
// ---------------------------------------------------------------------------

/// Run has been created but not yet claimed by a worker.
pub const RUN_PENDING: &str = "pending";

/// Run has been claimed and the script is executing.
pub const RUN_RUNNING: &str = "running";

/// Script returned normally within its deadline.
pub const RUN_COMPLETED: &str = "completed";

/// Script threw, could not be loaded, or the runner failed.
pub const RUN_FAILED: &str = "failed";

/// Script was killed because it exceeded the run deadline.
pub const RUN_TIMEOUT: &str = "timeout";

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// A single automation run with full outcome capture.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AutomationRun {
    pub id: DbId,
    pub organization_id: String,
    pub task_id: String,
    pub sandbox_id: Option<String>,
    pub status: String,
    /// Attempts consumed for this request (1..=3).
    pub attempt: i16,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Rendered `"[LEVEL] message"` log lines as a JSON array.
    pub logs: Option<serde_json::Value>,
    pub summary: Option<String>,
    /// SHA-256 hex digest of the executed script source.
    pub source_hash: Option<String>,
    pub duration_ms: Option<i32>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for enqueuing a new run.
#[derive(Debug, Clone)]
pub struct CreateAutomationRun {
    pub organization_id: String,
    pub task_id: String,
    pub sandbox_id: Option<String>,
}

/// Outcome fields written when a run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub attempt: i16,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub logs: serde_json::Value,
    pub summary: Option<String>,
    pub source_hash: Option<String>,
    pub duration_ms: i32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
