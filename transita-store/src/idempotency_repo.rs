use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use transita_core::idempotency::{IdempotencyRecord, IdempotencyStatus};
use transita_core::repository::IdempotencyRepository;
use transita_core::CoreResult;

use crate::pg::{db_err, IdempotencyRow};

pub struct PgIdempotencyRepository {
    pool: PgPool,
}

impl PgIdempotencyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyRepository for PgIdempotencyRepository {
    async fn get_record(&self, key: &str, actor_id: &str) -> CoreResult<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRow>("SELECT * FROM idempotency_keys WHERE key = $1 AND actor_id = $2")
            .bind(key)
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(IdempotencyRecord::try_from)
            .transpose()
    }

    async fn insert_pending(&self, record: &IdempotencyRecord) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, actor_id, method, endpoint, request_hash, status, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (key, actor_id) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(&record.actor_id)
        .bind(&record.method)
        .bind(&record.endpoint)
        .bind(&record.request_hash)
        .bind(record.status.as_str())
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_stale(&self, key: &str, actor_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys WHERE key = $1 AND actor_id = $2 AND (status = 'FAILED' OR expires_at <= $3)",
        )
        .bind(key)
        .bind(actor_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        key: &str,
        actor_id: &str,
        status: IdempotencyStatus,
        response: Option<&Value>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = $3, response_data = $4, error = $5, updated_at = $6
            WHERE key = $1 AND actor_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(key)
        .bind(actor_id)
        .bind(status.as_str())
        .bind(response)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE (key, actor_id) IN (
                SELECT key, actor_id FROM idempotency_keys WHERE expires_at <= $1 LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
