use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use transita_core::booking::{Booking, BookingStatus};
use transita_core::clock::Clock;
use transita_core::lock::ConfirmAction;
use transita_core::payment::{PaymentStatus, RefundStatus};
use transita_core::repository::{BookingCommit, BookingRepository};
use transita_core::{CoreError, CoreResult};

use crate::pg::{
    booking_for_update, db_err, free_booking_seats, lock_for_update, payment_for_update, store_available_seats,
    store_booking_status, store_lock, trip_for_update, BookingRow,
};

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn commit_booking(&self, commit: &BookingCommit, clock: &dyn Clock) -> CoreResult<()> {
        let booking = &commit.booking;
        let payment = &commit.payment;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let mut lock = lock_for_update(&mut tx, booking.lock_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", booking.lock_id)))?;
        let mut trip = trip_for_update(&mut tx, lock.trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", lock.trip_id)))?;

        // Both rows are held: no acquire can interleave from here on.
        let now = clock.now();
        if lock.check_confirm(booking.id, now)? == ConfirmAction::AlreadyConfirmed {
            return Ok(());
        }

        trip.remove_seats(&lock.seat_numbers)?;
        store_available_seats(&mut tx, &trip).await?;

        lock.confirm(booking.id, commit.retain_lock_until, now);
        store_lock(&mut tx, &lock).await?;

        sqlx::query(
            r#"
            INSERT INTO bookings (id, pnr, trip_id, lock_id, holder_id, passengers, contact, total_amount, currency, payment_status, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(booking.id)
        .bind(&booking.pnr)
        .bind(booking.trip_id)
        .bind(booking.lock_id)
        .bind(&booking.holder_id)
        .bind(Json(&booking.passengers))
        .bind(Json(&booking.contact))
        .bind(booking.total_amount)
        .bind(&booking.currency)
        .bind(booking.payment_status.as_str())
        .bind(booking.status.as_str())
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, agency_id, amount, platform_fee, agency_amount, currency, status, reference, transaction_id, payment_link, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payment.id)
        .bind(payment.booking_id)
        .bind(payment.agency_id)
        .bind(payment.amount)
        .bind(payment.platform_fee)
        .bind(payment.agency_amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.reference)
        .bind(&payment.transaction_id)
        .bind(&payment.payment_link)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn get_booking_by_lock(&self, lock_id: Uuid) -> CoreResult<Option<Booking>> {
        sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE lock_id = $1")
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Booking::try_from)
            .transpose()
    }

    async fn cancel_booking(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(Booking, bool)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut booking = booking_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", id)))?;

        if booking.status != BookingStatus::Confirmed {
            return Ok((booking, false));
        }

        booking.status = BookingStatus::Cancelled;
        booking.updated_at = now;
        store_booking_status(&mut tx, &booking).await?;
        free_booking_seats(&mut tx, &booking, now).await?;

        tx.commit().await.map_err(db_err)?;
        Ok((booking, true))
    }

    async fn fail_payment(&self, payment_id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let payment = payment_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", payment_id)))?;

        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }

        sqlx::query("UPDATE payments SET status = 'FAILED', failure_reason = $2, updated_at = $3 WHERE id = $1")
            .bind(payment_id)
            .bind(reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(mut booking) = booking_for_update(&mut tx, payment.booking_id).await? {
            let held_seats = booking.status == BookingStatus::Confirmed;
            booking.payment_status = PaymentStatus::Failed;
            if held_seats {
                booking.status = BookingStatus::Cancelled;
            }
            booking.updated_at = now;
            store_booking_status(&mut tx, &booking).await?;
            if held_seats {
                free_booking_seats(&mut tx, &booking, now).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn complete_refund(
        &self,
        payment_id: Uuid,
        refund_id: &str,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let payment = payment_for_update(&mut tx, payment_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", payment_id)))?;

        if !payment.refund_due() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, refund_id = $3, refund_status = $4, refund_error = NULL, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(status.as_str())
        .bind(refund_id)
        .bind(RefundStatus::Processed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(mut booking) = booking_for_update(&mut tx, payment.booking_id).await? {
            let held_seats = booking.status == BookingStatus::Confirmed;
            booking.status = BookingStatus::Refunded;
            booking.payment_status = status;
            booking.updated_at = now;
            store_booking_status(&mut tx, &booking).await?;
            if held_seats {
                free_booking_seats(&mut tx, &booking, now).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}
