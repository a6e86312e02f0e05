use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use transita_core::payment::{Payment, PaymentStatus};
use transita_core::repository::PaymentRepository;
use transita_core::{CoreError, CoreResult};

use crate::pg::{collect, db_err, payment_for_update, PaymentRow};

pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(&self, sql: &str, value: &str) -> CoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Payment::try_from)
            .transpose()
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn get_payment(&self, id: Uuid) -> CoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn get_payment_for_booking(&self, booking_id: Uuid) -> CoreResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE booking_id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Payment::try_from)
            .transpose()
    }

    async fn find_by_transaction(&self, transaction_id: &str) -> CoreResult<Option<Payment>> {
        self.fetch_one_by("SELECT * FROM payments WHERE transaction_id = $1", transaction_id)
            .await
    }

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>> {
        self.fetch_one_by("SELECT * FROM payments WHERE reference = $1", reference)
            .await
    }

    async fn attach_transaction(
        &self,
        id: Uuid,
        transaction_id: &str,
        payment_link: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET transaction_id = $2, payment_link = COALESCE($3, payment_link), updated_at = $4
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(transaction_id)
        .bind(payment_link)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_paid(
        &self,
        id: Uuid,
        transaction_id: Option<&str>,
        paid_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Conditional on PENDING, so a replayed webhook or a second
        // reconciliation run changes nothing.
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'PAID', transaction_id = COALESCE(transaction_id, $2), paid_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(transaction_id)
        .bind(paid_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE bookings SET payment_status = 'PAID', updated_at = $2 WHERE id = (SELECT booking_id FROM payments WHERE id = $1)",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn mark_refunded(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE payments SET status = 'REFUNDED', updated_at = $2 WHERE id = $1 AND status = 'REFUND_INITIATED'",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE bookings SET payment_status = 'REFUNDED', updated_at = $2 WHERE id = (SELECT booking_id FROM payments WHERE id = $1)",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn request_refund(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<Payment> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let payment = payment_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", id)))?;

        if payment.status != PaymentStatus::Paid {
            return Err(CoreError::Conflict(format!(
                "payment {} is {} and cannot be refunded",
                id,
                payment.status.as_str()
            )));
        }
        if payment.refund_requested {
            return Ok(payment);
        }

        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            UPDATE payments
            SET refund_requested = TRUE, refund_reason = $2, refund_status = 'REQUESTED', updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Payment::try_from(row)
    }

    async fn fail_refund(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET refund_status = 'FAILED', refund_error = $2, updated_at = $3
            WHERE id = $1 AND refund_status = 'REQUESTED'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM payments WHERE status = 'PENDING' AND created_at <= $1 ORDER BY created_at LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }

    async fn refund_initiated_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM payments WHERE status = 'REFUND_INITIATED' AND updated_at <= $1 ORDER BY updated_at LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }

    async fn refunds_due(&self, limit: i64) -> CoreResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT * FROM payments
            WHERE status = 'PAID' AND refund_requested AND refund_status = 'REQUESTED'
            ORDER BY updated_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }
}
