//! Row mappings and the statements shared by more than one repository.
//!
//! Multi-row transitions take row locks in one order: payment, booking,
//! lock, trip. Holding to it keeps concurrent transactions deadlock-free.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

use transita_core::booking::{Booking, ContactInfo, Passenger};
use transita_core::idempotency::IdempotencyRecord;
use transita_core::lock::SeatLock;
use transita_core::payment::Payment;
use transita_core::settlement::{Settlement, SettlementTotals};
use transita_core::trip::Trip;
use transita_core::{CoreError, CoreResult};

pub(crate) fn db_err(err: sqlx::Error) -> CoreError {
    CoreError::StorageError(err.to_string())
}

#[derive(sqlx::FromRow)]
pub(crate) struct TripRow {
    id: Uuid,
    agency_id: Uuid,
    capacity: i32,
    seat_numbers: Vec<String>,
    available_seats: Vec<String>,
    fare_amount: i64,
    currency: String,
    departs_at: DateTime<Utc>,
}

impl From<TripRow> for Trip {
    fn from(row: TripRow) -> Self {
        Trip {
            id: row.id,
            agency_id: row.agency_id,
            capacity: row.capacity,
            seat_numbers: row.seat_numbers,
            available_seats: row.available_seats,
            fare_amount: row.fare_amount,
            currency: row.currency,
            departs_at: row.departs_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct LockRow {
    id: Uuid,
    trip_id: Uuid,
    holder_id: String,
    seat_numbers: Vec<String>,
    status: String,
    booking_id: Option<Uuid>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LockRow> for SeatLock {
    type Error = CoreError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        Ok(SeatLock {
            id: row.id,
            trip_id: row.trip_id,
            holder_id: row.holder_id,
            seat_numbers: row.seat_numbers,
            status: row.status.parse()?,
            booking_id: row.booking_id,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct BookingRow {
    id: Uuid,
    pnr: String,
    trip_id: Uuid,
    lock_id: Uuid,
    holder_id: String,
    passengers: Json<Vec<Passenger>>,
    contact: Json<ContactInfo>,
    total_amount: i64,
    currency: String,
    payment_status: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = CoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            pnr: row.pnr,
            trip_id: row.trip_id,
            lock_id: row.lock_id,
            holder_id: row.holder_id,
            passengers: row.passengers.0,
            contact: row.contact.0,
            total_amount: row.total_amount,
            currency: row.currency,
            payment_status: row.payment_status.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PaymentRow {
    id: Uuid,
    booking_id: Uuid,
    agency_id: Uuid,
    amount: i64,
    platform_fee: i64,
    agency_amount: i64,
    currency: String,
    status: String,
    reference: String,
    transaction_id: Option<String>,
    payment_link: Option<String>,
    failure_reason: Option<String>,
    refund_requested: bool,
    refund_reason: Option<String>,
    refund_status: Option<String>,
    refund_id: Option<String>,
    refund_error: Option<String>,
    settlement_id: Option<Uuid>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = CoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            booking_id: row.booking_id,
            agency_id: row.agency_id,
            amount: row.amount,
            platform_fee: row.platform_fee,
            agency_amount: row.agency_amount,
            currency: row.currency,
            status: row.status.parse()?,
            reference: row.reference,
            transaction_id: row.transaction_id,
            payment_link: row.payment_link,
            failure_reason: row.failure_reason,
            refund_requested: row.refund_requested,
            refund_reason: row.refund_reason,
            refund_status: row.refund_status.map(|s| s.parse()).transpose()?,
            refund_id: row.refund_id,
            refund_error: row.refund_error,
            settlement_id: row.settlement_id,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct IdempotencyRow {
    key: String,
    actor_id: String,
    method: String,
    endpoint: String,
    request_hash: String,
    status: String,
    response_data: Option<Value>,
    error: Option<String>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = CoreError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            key: row.key,
            actor_id: row.actor_id,
            method: row.method,
            endpoint: row.endpoint,
            request_hash: row.request_hash,
            status: row.status.parse()?,
            response_data: row.response_data,
            error: row.error,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SettlementRow {
    id: Uuid,
    agency_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    currency: String,
    gross_amount: i64,
    fee_amount: i64,
    net_amount: i64,
    payment_count: i64,
    status: String,
    payout_reference: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct TotalsRow {
    agency_id: Uuid,
    currency: String,
    gross_amount: i64,
    fee_amount: i64,
    net_amount: i64,
    payment_count: i64,
}

impl From<TotalsRow> for SettlementTotals {
    fn from(row: TotalsRow) -> Self {
        SettlementTotals {
            agency_id: row.agency_id,
            currency: row.currency,
            gross_amount: row.gross_amount,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            payment_count: row.payment_count,
        }
    }
}

impl TryFrom<SettlementRow> for Settlement {
    type Error = CoreError;

    fn try_from(row: SettlementRow) -> Result<Self, Self::Error> {
        Ok(Settlement {
            id: row.id,
            agency_id: row.agency_id,
            period_start: row.period_start,
            period_end: row.period_end,
            currency: row.currency,
            gross_amount: row.gross_amount,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            payment_count: row.payment_count,
            status: row.status.parse()?,
            payout_reference: row.payout_reference,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> CoreResult<Vec<T>>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub(crate) async fn trip_for_update(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Trip>> {
    let row = sqlx::query_as::<_, TripRow>("SELECT * FROM trips WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(row.map(Trip::from))
}

pub(crate) async fn store_available_seats(conn: &mut PgConnection, trip: &Trip) -> CoreResult<()> {
    sqlx::query("UPDATE trips SET available_seats = $2 WHERE id = $1")
        .bind(trip.id)
        .bind(&trip.available_seats)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn lock_for_update(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<SeatLock>> {
    sqlx::query_as::<_, LockRow>("SELECT * FROM seat_locks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(SeatLock::try_from)
        .transpose()
}

pub(crate) async fn store_lock(conn: &mut PgConnection, lock: &SeatLock) -> CoreResult<()> {
    sqlx::query(
        "UPDATE seat_locks SET status = $2, booking_id = $3, expires_at = $4, updated_at = $5 WHERE id = $1",
    )
    .bind(lock.id)
    .bind(lock.status.as_str())
    .bind(lock.booking_id)
    .bind(lock.expires_at)
    .bind(lock.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn booking_for_update(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Booking>> {
    sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Booking::try_from)
        .transpose()
}

pub(crate) async fn store_booking_status(conn: &mut PgConnection, booking: &Booking) -> CoreResult<()> {
    sqlx::query("UPDATE bookings SET status = $2, payment_status = $3, updated_at = $4 WHERE id = $1")
        .bind(booking.id)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(booking.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn payment_for_update(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Payment>> {
    sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(Payment::try_from)
        .transpose()
}

/// Releases the booking's lock and hands its seats back to the trip.
pub(crate) async fn free_booking_seats(conn: &mut PgConnection, booking: &Booking, now: DateTime<Utc>) -> CoreResult<()> {
    if let Some(mut lock) = lock_for_update(conn, booking.lock_id).await? {
        if lock.release(now) {
            store_lock(conn, &lock).await?;
        }
    }
    if let Some(mut trip) = trip_for_update(conn, booking.trip_id).await? {
        trip.restore_seats(&booking.seat_numbers());
        store_available_seats(conn, &trip).await?;
    }
    Ok(())
}
