//! Script source loading.
//!
//! Resolves an execution request to its stored source text under the
//! `{organization_id}/{task_id}.automation.js` key layout. A missing
//! object is a fatal, non-retryable failure for the run; backend
//! unavailability is retryable at the queue level.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use pact_core::identity::ExecutionRequest;

/// Errors from script source resolution.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No source object exists for this request.
    #[error("script source not found: {key}")]
    NotFound { key: String },

    /// The object exists but is not usable source text.
    #[error("script source is invalid: {0}")]
    Invalid(String),

    /// The backend could not be reached or errored.
    #[error("script store unavailable: {0}")]
    Unavailable(String),
}

/// A script source backend.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Load the full source text for `request`.
    async fn load(&self, request: &ExecutionRequest) -> Result<String, SourceError>;
}

// ---------------------------------------------------------------------------
// Local filesystem backend
// ---------------------------------------------------------------------------

/// Scripts stored under a local directory, keyed the same way as S3.
pub struct LocalSourceStore {
    base_dir: PathBuf,
}

impl LocalSourceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl SourceStore for LocalSourceStore {
    async fn load(&self, request: &ExecutionRequest) -> Result<String, SourceError> {
        let key = request.storage_key();
        let path = self.base_dir.join(&key);

        match tokio::fs::read_to_string(&path).await {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SourceError::NotFound { key }),
            Err(e) if e.kind() == ErrorKind::InvalidData => Err(SourceError::Invalid(
                "script source is not valid UTF-8".to_string(),
            )),
            Err(e) => Err(SourceError::Unavailable(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// S3 backend
// ---------------------------------------------------------------------------

/// Scripts stored as objects in an S3 bucket.
pub struct S3SourceStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3SourceStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a store from the ambient AWS environment (credentials chain,
    /// optional region override).
    pub async fn from_env(bucket: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

#[async_trait]
impl SourceStore for S3SourceStore {
    async fn load(&self, request: &ExecutionRequest) -> Result<String, SourceError> {
        let key = request.storage_key();

        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                return Err(if not_found {
                    SourceError::NotFound { key }
                } else {
                    SourceError::Unavailable(err.to_string())
                });
            }
        };

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?
            .into_bytes();

        String::from_utf8(bytes.to_vec())
            .map_err(|_| SourceError::Invalid("script source is not valid UTF-8".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
