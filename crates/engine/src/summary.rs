//! Summarizer client.
//!
//! The summarization service is a black box that turns a run's outcome and
//! recent log lines into one or two sentences. It is strictly best-effort:
//! every failure here is swallowed by the caller and the run's own result
//! is unaffected.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// How many trailing log lines accompany a summarization request.
pub const SUMMARY_LOG_TAIL: usize = 20;

/// HTTP request timeout for a summarization attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the summarization service.
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    /// The underlying HTTP request failed (network, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status.
    #[error("Summarizer returned HTTP {0}")]
    HttpStatus(u16),

    /// The service responded but without a usable summary.
    #[error("Summarizer response was malformed: {0}")]
    Malformed(String),
}

/// A natural-language summarization service.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a short human-readable summary of `subject` (the run's
    /// output or error) given the trailing log lines.
    async fn summarize(&self, subject: &str, log_tail: &[String])
        -> Result<String, SummarizerError>;
}

/// HTTP summarizer client.
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(
        &self,
        subject: &str,
        log_tail: &[String],
    ) -> Result<String, SummarizerError> {
        let payload = serde_json::json!({
            "subject": subject,
            "logs": log_tail,
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(SummarizerError::HttpStatus(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        body.get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| SummarizerError::Malformed("missing 'summary' field".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
