//! Repository for the `secrets` table.
//!
//! Every read is scoped by `organization_id`; there is intentionally no
//! unscoped listing. Cross-tenant leakage here would defeat the whole
//! capability model, so the scope column appears in every WHERE clause.

use sqlx::PgPool;

use pact_core::types::DbId;

use crate::models::secret::{CreateSecret, SecretRecord};

/// Column list for `secrets` SELECT queries.
const COLUMNS: &str = "\
    id, organization_id, name, encrypted_value, \
    last_used_at, created_at, updated_at";

/// Provides query operations for organization secrets.
pub struct SecretRepo;

impl SecretRepo {
    /// Insert a new secret.
    pub async fn create(pool: &PgPool, dto: &CreateSecret) -> Result<SecretRecord, sqlx::Error> {
        let id: DbId = sqlx::query_scalar(
            "INSERT INTO secrets (organization_id, name, encrypted_value) \
             VALUES ($1, $2, $3) \
             RETURNING id",
        )
        .bind(&dto.organization_id)
        .bind(&dto.name)
        .bind(&dto.encrypted_value)
        .fetch_one(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Find a secret by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<SecretRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM secrets WHERE id = $1");
        sqlx::query_as::<_, SecretRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List all secrets belonging to one organization, ordered by name.
    pub async fn list_for_organization(
        pool: &PgPool,
        organization_id: &str,
    ) -> Result<Vec<SecretRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM secrets \
             WHERE organization_id = $1 \
             ORDER BY name"
        );
        sqlx::query_as::<_, SecretRecord>(&query)
            .bind(organization_id)
            .fetch_all(pool)
            .await
    }

    /// Record that a secret was read. Last-write-wins under concurrency,
    /// which is acceptable for usage tracking.
    pub async fn touch_last_used(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE secrets SET last_used_at = now(), updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Delete a secret.
    pub async fn delete(pool: &PgPool, organization_id: &str, id: DbId) -> Result<bool, sqlx::Error> {
        let rows = sqlx::query("DELETE FROM secrets WHERE id = $1 AND organization_id = $2")
            .bind(id)
            .bind(organization_id)
            .execute(pool)
            .await?
            .rows_affected();

        Ok(rows > 0)
    }
}
