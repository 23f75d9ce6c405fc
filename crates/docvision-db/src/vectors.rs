//! pgvector-backed vector store.
//!
//! Connection and query failures surface as
//! [`Error::VectorStoreUnreachable`] so callers can fail open.

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, instrument};

use docvision_core::{Error, JobId, Result, VectorMatch, VectorNamespace, VectorStore};

fn unreachable(e: sqlx::Error) -> Error {
    Error::VectorStoreUnreachable(e.to_string())
}

/// PostgreSQL + pgvector implementation of VectorStore.
#[derive(Clone)]
pub struct PgVectorStore {
    pool: Pool<Postgres>,
}

impl PgVectorStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert(
        &self,
        namespace: VectorNamespace,
        job_id: &JobId,
        vector: &[f32],
        payload: JsonValue,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO document_vector (namespace, job_id, embedding, dims, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace, job_id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                dims = EXCLUDED.dims,
                payload = EXCLUDED.payload,
                created_at = NOW()
            "#,
        )
        .bind(namespace.as_str())
        .bind(job_id.as_str())
        .bind(Vector::from(vector.to_vec()))
        .bind(vector.len() as i32)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(unreachable)?;
        Ok(())
    }

    #[instrument(skip(self, vector), fields(subsystem = "db", component = "vectors", namespace = namespace.as_str()))]
    async fn nearest(
        &self,
        namespace: VectorNamespace,
        vector: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<VectorMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, payload, (1.0 - (embedding <=> $1::vector))::real AS similarity
            FROM document_vector
            WHERE namespace = $2 AND dims = $3
            ORDER BY embedding <=> $1::vector
            LIMIT $4
            "#,
        )
        .bind(Vector::from(vector.to_vec()))
        .bind(namespace.as_str())
        .bind(vector.len() as i32)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unreachable)?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let similarity: Option<f32> = row.try_get("similarity").map_err(unreachable)?;
            // NULL/NaN for zero-norm vectors
            let Some(similarity) = similarity.filter(|s| !s.is_nan()) else {
                continue;
            };
            if similarity < min_similarity {
                continue;
            }
            matches.push(VectorMatch {
                job_id: JobId::from(row.try_get::<String, _>("job_id").map_err(unreachable)?),
                similarity,
                payload: row.try_get("payload").map_err(unreachable)?,
            });
        }

        debug!(result_count = matches.len(), "Nearest-neighbor lookup");
        Ok(matches)
    }
}
