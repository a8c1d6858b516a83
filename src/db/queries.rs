use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::artifact::{ArtifactMetadata, ArtifactStatus};
use crate::models::job::{Job, JobError, JobStatus};
use crate::models::report::{Report, ReportDraft};

const JOB_COLUMNS: &str = "job_id, status, input_ref, params, attempt_count, created_at, \
    started_at, finished_at, error";

const ARTIFACT_COLUMNS: &str = "artifact_id, job_id, file_name, format, size_bytes, \
    storage_key, status, error, created_at";

fn decode_err(column: &str, e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(|e| decode_err("status", e))?;
    let error: Option<Json<JobError>> = row.try_get("error")?;

    Ok(Job {
        job_id: row.try_get("job_id")?,
        status,
        input_ref: row.try_get("input_ref")?,
        params: row.try_get("params")?,
        attempt_count: row.try_get("attempt_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        error: error.map(|Json(e)| e),
    })
}

fn artifact_from_row(row: &PgRow) -> Result<ArtifactMetadata, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = ArtifactStatus::from_str(&status).map_err(|e| decode_err("status", e))?;

    Ok(ArtifactMetadata {
        artifact_id: row.try_get("artifact_id")?,
        job_id: row.try_get("job_id")?,
        file_name: row.try_get("file_name")?,
        format: row.try_get("format")?,
        size_bytes: row.try_get("size_bytes")?,
        storage_key: row.try_get("storage_key")?,
        status,
        error: row.try_get("error")?,
        access_url: None,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a new analysis job
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO analysis_jobs (job_id, status, input_ref, params, attempt_count, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(job.job_id)
    .bind(job.status.as_str())
    .bind(&job.input_ref)
    .bind(&job.params)
    .bind(job.attempt_count)
    .bind(job.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let query = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE job_id = $1");
    let row = sqlx::query(&query)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Move a non-terminal job to running and record the delivery attempt.
pub async fn mark_job_running(pool: &PgPool, job_id: Uuid, attempt: i32) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'running',
            attempt_count = GREATEST(attempt_count, $2),
            started_at = COALESCE(started_at, NOW())
        WHERE job_id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Return a running job to pending ahead of a redelivery
pub async fn release_job(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE analysis_jobs SET status = 'pending' WHERE job_id = $1 AND status = 'running'")
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Commit a report, its complete artifact set and the `succeeded` status in
/// one transaction.
///
/// The job row is locked first, so concurrent commits for the same job run
/// one after the other and the later one replaces the earlier one's
/// artifacts wholesale. Fails with `RowNotFound` for an unknown job.
pub async fn commit_report(
    pool: &PgPool,
    job_id: Uuid,
    report: &ReportDraft,
    artifacts: &[ArtifactMetadata],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT job_id FROM analysis_jobs WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO analysis_reports (job_id, report_payload, execution_time_ms)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO UPDATE
        SET report_payload = EXCLUDED.report_payload,
            execution_time_ms = EXCLUDED.execution_time_ms,
            updated_at = NOW()
        "#,
    )
    .bind(job_id)
    .bind(&report.payload)
    .bind(report.execution_time_ms)
    .execute(&mut *tx)
    .await?;

    let keep: Vec<Uuid> = artifacts.iter().map(|a| a.artifact_id).collect();
    sqlx::query("DELETE FROM analysis_artifacts WHERE job_id = $1 AND NOT (artifact_id = ANY($2))")
        .bind(job_id)
        .bind(&keep)
        .execute(&mut *tx)
        .await?;

    for (position, artifact) in artifacts.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO analysis_artifacts
                (artifact_id, job_id, position, file_name, format, size_bytes,
                 storage_key, status, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (artifact_id) DO UPDATE
            SET position = EXCLUDED.position,
                file_name = EXCLUDED.file_name,
                format = EXCLUDED.format,
                size_bytes = EXCLUDED.size_bytes,
                storage_key = EXCLUDED.storage_key,
                status = EXCLUDED.status,
                error = EXCLUDED.error
            "#,
        )
        .bind(artifact.artifact_id)
        .bind(job_id)
        .bind(position as i32)
        .bind(&artifact.file_name)
        .bind(&artifact.format)
        .bind(artifact.size_bytes)
        .bind(&artifact.storage_key)
        .bind(artifact.status.as_str())
        .bind(&artifact.error)
        .bind(artifact.created_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'succeeded',
            error = NULL,
            finished_at = NOW()
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Mark a job failed unless it already succeeded
pub async fn commit_failure(pool: &PgPool, job_id: Uuid, error: &JobError) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = CASE WHEN status = 'succeeded' THEN status ELSE 'failed' END,
            error = CASE WHEN status = 'succeeded' THEN error ELSE $2 END,
            finished_at = CASE WHEN status = 'succeeded' THEN finished_at ELSE NOW() END
        WHERE job_id = $1
        RETURNING status
        "#,
    )
    .bind(job_id)
    .bind(Json(error))
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => {
            let status: String = r.try_get("status")?;
            Ok(status == JobStatus::Failed.as_str())
        }
        None => Err(sqlx::Error::RowNotFound),
    }
}

/// Get the committed report for a succeeded job, artifacts in report order
pub async fn get_report(pool: &PgPool, job_id: Uuid) -> Result<Option<Report>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    // Read report and artifacts from one snapshot so a concurrent recommit
    // can never mix two artifact sets.
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await?;

    let row = sqlx::query(
        r#"
        SELECT r.job_id, r.report_payload, r.execution_time_ms, r.created_at, r.updated_at
        FROM analysis_reports r
        JOIN analysis_jobs j ON j.job_id = r.job_id
        WHERE r.job_id = $1 AND j.status = 'succeeded'
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let query = format!(
        "SELECT {ARTIFACT_COLUMNS} FROM analysis_artifacts WHERE job_id = $1 ORDER BY position ASC"
    );
    let artifacts = sqlx::query(&query)
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(artifact_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    tx.commit().await?;

    Ok(Some(Report {
        job_id: row.try_get("job_id")?,
        payload: row.try_get("report_payload")?,
        artifacts,
        execution_time_ms: row.try_get("execution_time_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}
