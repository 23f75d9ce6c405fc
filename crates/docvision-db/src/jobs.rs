//! Job store implementation.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use docvision_core::{
    BackendKind, DocumentJob, Error, ErrorKind, Fingerprint, FingerprintKind, JobError, JobId,
    JobSource, JobStatus, JobStore, MetadataRecord, Result,
};

const INSERT_JOB: &str = r#"
INSERT INTO document_job (
    job_id, execution_id, source, raw_path, archive_document_id, original_filename,
    fingerprint_kind, fingerprint, status, backend_used, attempt_count, max_attempts,
    result, duplicate_of, error_kind, error_message, warnings, created_at, updated_at, checksum
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
ON CONFLICT (job_id) DO NOTHING
"#;

const UPDATE_JOB: &str = r#"
UPDATE document_job SET
    source = $3, raw_path = $4, archive_document_id = $5, original_filename = $6,
    fingerprint_kind = $7, fingerprint = $8, status = $9, backend_used = $10,
    attempt_count = $11, max_attempts = $12, result = $13, duplicate_of = $14,
    error_kind = $15, error_message = $16, warnings = $17, created_at = $18, updated_at = $19,
    checksum = $20
WHERE job_id = $1 AND execution_id = $2
"#;

const SELECT_JOB: &str = r#"
SELECT job_id, execution_id, source, raw_path, archive_document_id, original_filename,
       fingerprint_kind, fingerprint, status, backend_used, attempt_count, max_attempts,
       result, duplicate_of, error_kind, error_message, warnings, created_at, updated_at,
       checksum
FROM document_job
"#;

/// PostgreSQL implementation of JobStore.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Bind every column of `job` in `INSERT_JOB` / `UPDATE_JOB` order.
    fn bind_job<'q>(
        query: Query<'q, Postgres, PgArguments>,
        job: &'q DocumentJob,
    ) -> Result<Query<'q, Postgres, PgArguments>> {
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let warnings = serde_json::to_value(&job.warnings)?;

        Ok(query
            .bind(job.job_id.as_str())
            .bind(job.execution_id)
            .bind(job.source.as_str())
            .bind(
                job.raw_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )
            .bind(job.archive_document_id)
            .bind(job.original_filename.as_deref())
            .bind(job.fingerprint.as_ref().map(|f| f.kind.as_str()))
            .bind(job.fingerprint.as_ref().map(|f| f.vector.clone()))
            .bind(job.status.as_str())
            .bind(job.backend_used.map(BackendKind::as_str))
            .bind(job.attempt_count as i32)
            .bind(job.max_attempts as i32)
            .bind(result)
            .bind(job.duplicate_of.as_ref().map(|d| d.as_str().to_string()))
            .bind(job.error.as_ref().map(|e| e.kind.as_str()))
            .bind(job.error.as_ref().map(|e| e.message.clone()))
            .bind(warnings)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.checksum.as_deref()))
    }

    /// Parse a job row into a DocumentJob.
    fn parse_job_row(row: &PgRow) -> Result<DocumentJob> {
        let fingerprint = match (
            row.try_get::<Option<String>, _>("fingerprint_kind")?,
            row.try_get::<Option<Vec<f32>>, _>("fingerprint")?,
        ) {
            (Some(kind), Some(vector)) => Some(Fingerprint {
                kind: kind.parse::<FingerprintKind>()?,
                vector,
            }),
            _ => None,
        };

        let error = match row.try_get::<Option<String>, _>("error_kind")? {
            Some(kind) => Some(JobError {
                kind: kind.parse::<ErrorKind>()?,
                message: row
                    .try_get::<Option<String>, _>("error_message")?
                    .unwrap_or_default(),
            }),
            None => None,
        };

        let result = row
            .try_get::<Option<JsonValue>, _>("result")?
            .map(serde_json::from_value::<MetadataRecord>)
            .transpose()?;
        let warnings: Vec<String> =
            serde_json::from_value(row.try_get::<JsonValue, _>("warnings")?)?;

        Ok(DocumentJob {
            job_id: JobId::from(row.try_get::<String, _>("job_id")?),
            execution_id: row.try_get("execution_id")?,
            source: row.try_get::<String, _>("source")?.parse::<JobSource>()?,
            raw_path: row
                .try_get::<Option<String>, _>("raw_path")?
                .map(Into::into),
            archive_document_id: row.try_get("archive_document_id")?,
            original_filename: row.try_get("original_filename")?,
            checksum: row.try_get("checksum")?,
            fingerprint,
            status: row.try_get::<String, _>("status")?.parse::<JobStatus>()?,
            backend_used: row
                .try_get::<Option<String>, _>("backend_used")?
                .map(|b| b.parse::<BackendKind>())
                .transpose()?,
            attempt_count: row.try_get::<i32, _>("attempt_count")?.max(0) as u32,
            max_attempts: row.try_get::<i32, _>("max_attempts")?.max(0) as u32,
            result,
            duplicate_of: row
                .try_get::<Option<String>, _>("duplicate_of")?
                .map(JobId::from),
            error,
            warnings,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_or_replace_terminal(&self, job: &DocumentJob) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT status FROM document_job WHERE job_id = $1 FOR UPDATE")
                .bind(job.job_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(status) = existing {
            let status = status.parse::<JobStatus>()?;
            if !status.is_terminal() {
                tx.rollback().await?;
                return Ok(false);
            }
            sqlx::query(
                "INSERT INTO document_job_history SELECT *, NOW() FROM document_job \
                 WHERE job_id = $1 ON CONFLICT DO NOTHING",
            )
            .bind(job.job_id.as_str())
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM document_job WHERE job_id = $1")
                .bind(job.job_id.as_str())
                .execute(&mut *tx)
                .await?;
            debug!(job_id = %job.job_id, previous = %status, "Archived terminal job record");
        }

        // A concurrent insert of the same id wins; report it as active.
        let inserted = Self::bind_job(sqlx::query(INSERT_JOB), job)?
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(inserted == 1)
    }

    async fn update(&self, job: &DocumentJob) -> Result<()> {
        let updated = Self::bind_job(sqlx::query(UPDATE_JOB), job)?
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!(
                "job {} (execution {})",
                job.job_id, job.execution_id
            )));
        }
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<DocumentJob>> {
        let row = sqlx::query(&format!("{SELECT_JOB} WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<DocumentJob>> {
        let rows = sqlx::query(&format!(
            "{SELECT_JOB} WHERE status NOT IN ('completed', 'skipped_duplicate', 'failed') \
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<DocumentJob>> {
        let rows = sqlx::query(&format!(
            "{SELECT_JOB} ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_job_row).collect()
    }
}
