//! Per-run log collection.
//!
//! Both the host (lifecycle milestones, at `System` level) and the script
//! (via the injected console sink) append here. Entries carry a strictly
//! increasing sequence number so interleaved host/script output has one
//! total order.

use serde::{Deserialize, Serialize};

/// Maximum number of entries retained per run; further appends are dropped.
pub const MAX_LOG_ENTRIES: usize = 1000;

/// Maximum message size per entry; longer messages are truncated.
pub const MAX_LOG_MESSAGE_BYTES: usize = 4096;

/// Severity of a log entry.
///
/// `Log`/`Info`/`Warn`/`Error` correspond to the script's console methods;
/// `System` is reserved for host lifecycle milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    System,
}

impl LogLevel {
    /// Uppercase rendering used in the caller-facing log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::System => "SYSTEM",
        }
    }
}

/// One log line emitted during a run.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub sequence: u64,
}

impl LogEntry {
    /// Render as the stable `"[LEVEL] message"` line downstream callers see.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.level.as_str(), self.message)
    }
}

/// Append-only, order-preserving log buffer for one run.
#[derive(Debug, Default)]
pub struct LogCollector {
    entries: Vec<LogEntry>,
    next_sequence: u64,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, truncating oversize messages and dropping appends
    /// past [`MAX_LOG_ENTRIES`] so a log-spamming script cannot exhaust
    /// memory.
    pub fn append(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.entries.len() >= MAX_LOG_ENTRIES {
            return;
        }

        let message = message.into();
        let message = if message.len() > MAX_LOG_MESSAGE_BYTES {
            let mut end = MAX_LOG_MESSAGE_BYTES;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated)", &message[..end])
        } else {
            message
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(LogEntry {
            level,
            message,
            sequence,
        });
    }

    /// All entries in emission order.
    pub fn all(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The last `n` entries in emission order.
    pub fn tail(&self, n: usize) -> &[LogEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the collector, yielding the entries for the final result.
    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
