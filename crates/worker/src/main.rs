//! Automation worker binary: wires the engine to its stores and runs the
//! dispatcher until shutdown.

mod dispatcher;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pact_core::automation::sandbox::ScriptRunner;
use pact_engine::config::{EngineConfig, SourceBackend};
use pact_engine::executor::ExecutionHost;
use pact_engine::secrets::{PgSecretStore, SecretAccessor, SecretCipher};
use pact_engine::source::{LocalSourceStore, S3SourceStore, SourceStore};
use pact_engine::summary::{HttpSummarizer, Summarizer};

use dispatcher::RunDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pact_worker=debug,pact_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();

    let pool = pact_db::connect(&config.database_url).await?;

    let sources: Arc<dyn SourceStore> = match &config.source_backend {
        SourceBackend::Local { base_dir } => Arc::new(LocalSourceStore::new(base_dir)),
        SourceBackend::S3 { bucket, region } => {
            Arc::new(S3SourceStore::from_env(bucket.clone(), region.clone()).await)
        }
    };

    let cipher = SecretCipher::from_base64(&config.secrets_master_key)?;
    let secrets = Arc::new(SecretAccessor::new(
        Arc::new(PgSecretStore::new(pool.clone())),
        cipher,
    ));

    let summarizer: Option<Arc<dyn Summarizer>> = config
        .summarizer_url
        .as_ref()
        .map(|url| Arc::new(HttpSummarizer::new(url.clone())) as Arc<dyn Summarizer>);

    let engine = Arc::new(ExecutionHost::new(
        sources,
        secrets,
        summarizer,
        ScriptRunner::new(config.node_binary.clone()),
    ));

    let dispatcher = RunDispatcher::new(pool, engine, config.max_concurrent_runs);
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    tracing::info!("Automation worker ready");
    dispatcher.run(cancel).await;

    Ok(())
}
