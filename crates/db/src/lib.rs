//! Database models and repositories for the automation engine.
//!
//! Two tables: `secrets` (organization-scoped encrypted credentials) and
//! `automation_runs` (one row per dispatched execution, with full outcome
//! capture). Repositories follow the column-list/`query_as` convention and
//! return `sqlx::Error` directly; classification happens in the layers
//! above.

pub mod models;
pub mod repositories;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Default connection pool size for engine workers.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connect a pool to the given database URL.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(DEFAULT_MAX_CONNECTIONS)
        .connect(database_url)
        .await
}
