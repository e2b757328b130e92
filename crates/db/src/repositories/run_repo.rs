//! Repository for the `automation_runs` table.
//!
//! Pending rows are claimed with `FOR UPDATE SKIP LOCKED` so concurrent
//! workers never double-dispatch a run.

use sqlx::PgPool;

use pact_core::types::DbId;

use crate::models::run::{
    AutomationRun, CreateAutomationRun, RunOutcome, RUN_COMPLETED, RUN_FAILED, RUN_RUNNING,
    RUN_TIMEOUT,
};

/// Column list for `automation_runs` SELECT queries.
const COLUMNS: &str = "\
    id, organization_id, task_id, sandbox_id, status, attempt, \
    output, error_message, logs, summary, source_hash, duration_ms, \
    started_at, completed_at, created_at, updated_at";

/// Provides query operations for automation run records.
pub struct RunRepo;

impl RunRepo {
    /// Enqueue a new run with status `pending`.
    pub async fn create(
        pool: &PgPool,
        dto: &CreateAutomationRun,
    ) -> Result<AutomationRun, sqlx::Error> {
        let id: DbId = sqlx::query_scalar(
            "INSERT INTO automation_runs (organization_id, task_id, sandbox_id) \
             VALUES ($1, $2, $3) \
             RETURNING id",
        )
        .bind(&dto.organization_id)
        .bind(&dto.task_id)
        .bind(&dto.sandbox_id)
        .fetch_one(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Claim the oldest pending run, transitioning it to `running`.
    ///
    /// Returns `None` when no pending run exists. Safe under concurrent
    /// workers: the inner SELECT uses `FOR UPDATE SKIP LOCKED`.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<AutomationRun>, sqlx::Error> {
        let query = format!(
            "UPDATE automation_runs SET status = $1, started_at = now(), updated_at = now() \
             WHERE id = (\
                 SELECT id FROM automation_runs \
                 WHERE status = 'pending' \
                 ORDER BY created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED\
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AutomationRun>(&query)
            .bind(RUN_RUNNING)
            .fetch_optional(pool)
            .await
    }

    /// Mark a run as completed with full outcome capture.
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        outcome: &RunOutcome,
    ) -> Result<(), sqlx::Error> {
        Self::finalize(pool, id, RUN_COMPLETED, outcome).await
    }

    /// Mark a run as failed.
    pub async fn fail(pool: &PgPool, id: DbId, outcome: &RunOutcome) -> Result<(), sqlx::Error> {
        Self::finalize(pool, id, RUN_FAILED, outcome).await
    }

    /// Mark a run as timed out.
    pub async fn timeout(pool: &PgPool, id: DbId, outcome: &RunOutcome) -> Result<(), sqlx::Error> {
        Self::finalize(pool, id, RUN_TIMEOUT, outcome).await
    }

    async fn finalize(
        pool: &PgPool,
        id: DbId,
        status: &str,
        outcome: &RunOutcome,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE automation_runs SET \
                status = $2, \
                attempt = $3, \
                output = $4, \
                error_message = $5, \
                logs = $6, \
                summary = $7, \
                source_hash = $8, \
                duration_ms = $9, \
                completed_at = now(), \
                updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(outcome.attempt)
        .bind(&outcome.output)
        .bind(&outcome.error_message)
        .bind(&outcome.logs)
        .bind(&outcome.summary)
        .bind(&outcome.source_hash)
        .bind(outcome.duration_ms)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Find a run by its ID.
    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<AutomationRun>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM automation_runs WHERE id = $1");
        sqlx::query_as::<_, AutomationRun>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List runs for one task, most recent first, paginated.
    pub async fn list_for_task(
        pool: &PgPool,
        organization_id: &str,
        task_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AutomationRun>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM automation_runs \
             WHERE organization_id = $1 AND task_id = $2 \
             ORDER BY created_at DESC \
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as::<_, AutomationRun>(&query)
            .bind(organization_id)
            .bind(task_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }
}
