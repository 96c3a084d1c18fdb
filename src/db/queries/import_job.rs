//! Import job database queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::ImportJob;

const JOB_COLUMNS: &str = r#"
    id, user_id, file_name, file_size, total_rows, processed_rows, success_count,
    updated_count, error_count, status, mode, skip_errors, errors, resource_ids,
    rollback_reason, started_at, completed_at, created_at, updated_at, version
"#;

/// Insert a freshly submitted job
pub async fn insert_import_job(pool: &PgPool, job: &ImportJob) -> Result<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO import_jobs ({})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        "#,
        JOB_COLUMNS
    ))
    .bind(job.id)
    .bind(job.user_id)
    .bind(&job.file_name)
    .bind(job.file_size)
    .bind(job.total_rows)
    .bind(job.processed_rows)
    .bind(job.success_count)
    .bind(job.updated_count)
    .bind(job.error_count)
    .bind(job.status)
    .bind(job.mode)
    .bind(job.skip_errors)
    .bind(&job.errors)
    .bind(&job.resource_ids)
    .bind(&job.rollback_reason)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.version)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get job by ID
pub async fn get_import_job(pool: &PgPool, id: Uuid) -> Result<Option<ImportJob>> {
    let job = sqlx::query_as::<_, ImportJob>(&format!(
        "SELECT {} FROM import_jobs WHERE id = $1",
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Write back a job if its version is unchanged since it was read.
/// Returns the new version, or `None` when another writer got there first.
pub async fn update_import_job(pool: &PgPool, job: &ImportJob) -> Result<Option<i64>> {
    let version: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE import_jobs SET
            total_rows = $3,
            processed_rows = $4,
            success_count = $5,
            updated_count = $6,
            error_count = $7,
            status = $8,
            errors = $9,
            resource_ids = $10,
            rollback_reason = $11,
            started_at = $12,
            completed_at = $13,
            updated_at = $14,
            version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING version
        "#,
    )
    .bind(job.id)
    .bind(job.version)
    .bind(job.total_rows)
    .bind(job.processed_rows)
    .bind(job.success_count)
    .bind(job.updated_count)
    .bind(job.error_count)
    .bind(job.status)
    .bind(&job.errors)
    .bind(&job.resource_ids)
    .bind(&job.rollback_reason)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.updated_at)
    .fetch_optional(pool)
    .await?;

    Ok(version.map(|(v,)| v))
}
