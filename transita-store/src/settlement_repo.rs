use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use transita_core::repository::SettlementRepository;
use transita_core::settlement::{Settlement, SettlementStatus, SettlementTotals};
use transita_core::{CoreError, CoreResult};

use crate::pg::{collect, db_err, SettlementRow, TotalsRow};

pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementRepository for PgSettlementRepository {
    async fn unsettled_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<SettlementTotals>> {
        let rows = sqlx::query_as::<_, TotalsRow>(
            r#"
            SELECT p.agency_id,
                   p.currency,
                   SUM(p.amount)::BIGINT AS gross_amount,
                   SUM(p.platform_fee)::BIGINT AS fee_amount,
                   SUM(p.agency_amount)::BIGINT AS net_amount,
                   COUNT(*) AS payment_count
            FROM payments p
            WHERE p.status = 'PAID' AND p.settlement_id IS NULL AND p.paid_at >= $1 AND p.paid_at < $2
              AND NOT EXISTS (
                  SELECT 1 FROM settlements s
                  WHERE s.agency_id = p.agency_id AND s.currency = p.currency AND s.period_start = $1
              )
            GROUP BY p.agency_id, p.currency
            ORDER BY p.agency_id, p.currency
            LIMIT $3
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(SettlementTotals::from).collect())
    }

    async fn create_settlement(&self, settlement: &Settlement) -> CoreResult<Option<Settlement>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO settlements (id, agency_id, period_start, period_end, currency, gross_amount, fee_amount, net_amount, payment_count, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, 0, 0, 0, $6, $7, $7)
            ON CONFLICT (agency_id, period_start, currency) DO NOTHING
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.agency_id)
        .bind(settlement.period_start)
        .bind(settlement.period_end)
        .bind(&settlement.currency)
        .bind(settlement.status.as_str())
        .bind(settlement.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Ok(None);
        }

        // Totals come from the rows stamped here, so a payment that moved
        // since the aggregate was read is neither lost nor counted twice.
        let stored = sqlx::query_as::<_, SettlementRow>(
            r#"
            WITH stamped AS (
                UPDATE payments
                SET settlement_id = $1
                WHERE agency_id = $2 AND currency = $3 AND status = 'PAID' AND settlement_id IS NULL
                  AND paid_at >= $4 AND paid_at < $5
                RETURNING amount, platform_fee, agency_amount
            )
            UPDATE settlements
            SET gross_amount = totals.gross,
                fee_amount = totals.fee,
                net_amount = totals.net,
                payment_count = totals.count
            FROM (
                SELECT COALESCE(SUM(amount), 0)::BIGINT AS gross,
                       COALESCE(SUM(platform_fee), 0)::BIGINT AS fee,
                       COALESCE(SUM(agency_amount), 0)::BIGINT AS net,
                       COUNT(*) AS count
                FROM stamped
            ) AS totals
            WHERE settlements.id = $1
            RETURNING settlements.*
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.agency_id)
        .bind(&settlement.currency)
        .bind(settlement.period_start)
        .bind(settlement.period_end)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let stored = Settlement::try_from(stored)?;

        if stored.payment_count == 0 {
            // Nothing left to settle: keep the pair open for a later run.
            tx.rollback().await.map_err(db_err)?;
            return Err(CoreError::Conflict(format!(
                "no unsettled payments left for agency {} in {}",
                settlement.agency_id, settlement.currency
            )));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Some(stored))
    }

    async fn get_settlement(&self, id: Uuid) -> CoreResult<Option<Settlement>> {
        sqlx::query_as::<_, SettlementRow>("SELECT * FROM settlements WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Settlement::try_from)
            .transpose()
    }

    async fn list_settlements(&self, limit: i64) -> CoreResult<Vec<Settlement>> {
        let rows = sqlx::query_as::<_, SettlementRow>(
            "SELECT * FROM settlements ORDER BY period_start DESC, created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        payout_reference: Option<&str>,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Settlement>> {
        sqlx::query_as::<_, SettlementRow>(
            r#"
            UPDATE settlements
            SET status = $3,
                payout_reference = COALESCE($4, payout_reference),
                failure_reason = COALESCE($5, failure_reason),
                updated_at = $6
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(payout_reference)
        .bind(failure_reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(Settlement::try_from)
        .transpose()
    }
}
