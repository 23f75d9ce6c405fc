//! Backend lifecycle snapshots.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use docvision_core::{BackendHandle, BackendKind, BackendState, BackendStateStore, Result};

/// PostgreSQL implementation of BackendStateStore.
#[derive(Clone)]
pub struct PgBackendStore {
    pool: Pool<Postgres>,
}

impl PgBackendStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackendStateStore for PgBackendStore {
    async fn save_backend(&self, handle: &BackendHandle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backend_handle (kind, state, busy, last_active_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (kind) DO UPDATE SET
                state = EXCLUDED.state,
                busy = EXCLUDED.busy,
                last_active_at = EXCLUDED.last_active_at,
                updated_at = NOW()
            "#,
        )
        .bind(handle.kind.as_str())
        .bind(handle.state.as_str())
        .bind(handle.busy as i32)
        .bind(handle.last_active_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_backend(&self, kind: BackendKind) -> Result<Option<BackendHandle>> {
        let row = sqlx::query(
            "SELECT state, busy, last_active_at FROM backend_handle WHERE kind = $1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BackendHandle {
            kind,
            state: row.try_get::<String, _>("state")?.parse::<BackendState>()?,
            busy: row.try_get::<i32, _>("busy")?.max(0) as usize,
            last_active_at: row.try_get("last_active_at")?,
        }))
    }
}
