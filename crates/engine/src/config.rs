//! Engine configuration loaded from environment variables.

/// Script source storage backend selection.
#[derive(Debug, Clone)]
pub enum SourceBackend {
    /// Scripts under a local directory (development / single-host).
    Local { base_dir: String },
    /// Scripts in an S3 bucket.
    S3 {
        bucket: String,
        region: Option<String>,
    },
}

/// Engine configuration.
///
/// Most fields have defaults suitable for local development; the secrets
/// master key must always be provided explicitly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Postgres connection URL.
    pub database_url: String,
    /// Where script source objects live.
    pub source_backend: SourceBackend,
    /// Base64-encoded 32-byte AES-256-GCM key for stored secrets.
    pub secrets_master_key: String,
    /// Summarization service endpoint; summaries are skipped when unset.
    pub summarizer_url: Option<String>,
    /// Deployment-wide cap on concurrent executions.
    pub max_concurrent_runs: usize,
    /// Node binary used to host script runners.
    pub node_binary: String,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var               | Default                            |
    /// |-----------------------|------------------------------------|
    /// | `DATABASE_URL`        | `postgres://localhost:5432/pact`   |
    /// | `SCRIPT_STORE_BACKEND`| `local`                            |
    /// | `SCRIPT_STORE_PATH`   | `./scripts`                        |
    /// | `SCRIPT_STORE_BUCKET` | (required when backend is `s3`)    |
    /// | `SCRIPT_STORE_REGION` | (optional)                         |
    /// | `SECRETS_MASTER_KEY`  | (required)                         |
    /// | `SUMMARIZER_URL`      | (unset: summaries skipped)         |
    /// | `MAX_CONCURRENT_RUNS` | `4`                                |
    /// | `NODE_BINARY`         | `node`                             |
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost:5432/pact".into());

        let backend = std::env::var("SCRIPT_STORE_BACKEND").unwrap_or_else(|_| "local".into());
        let source_backend = match backend.as_str() {
            "local" => SourceBackend::Local {
                base_dir: std::env::var("SCRIPT_STORE_PATH").unwrap_or_else(|_| "./scripts".into()),
            },
            "s3" => SourceBackend::S3 {
                bucket: std::env::var("SCRIPT_STORE_BUCKET")
                    .expect("SCRIPT_STORE_BUCKET must be set when SCRIPT_STORE_BACKEND=s3"),
                region: std::env::var("SCRIPT_STORE_REGION").ok(),
            },
            other => panic!("SCRIPT_STORE_BACKEND must be 'local' or 's3', got '{other}'"),
        };

        let secrets_master_key =
            std::env::var("SECRETS_MASTER_KEY").expect("SECRETS_MASTER_KEY must be set");

        let summarizer_url = std::env::var("SUMMARIZER_URL").ok().filter(|s| !s.is_empty());

        let max_concurrent_runs: usize = std::env::var("MAX_CONCURRENT_RUNS")
            .unwrap_or_else(|_| "4".into())
            .parse()
            .expect("MAX_CONCURRENT_RUNS must be a valid usize");

        let node_binary = std::env::var("NODE_BINARY").unwrap_or_else(|_| "node".into());

        Self {
            database_url,
            source_backend,
            secrets_master_key,
            summarizer_url,
            max_concurrent_runs,
            node_binary,
        }
    }
}
