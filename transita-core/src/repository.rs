use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::booking::Booking;
use crate::clock::Clock;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus};
use crate::lock::{NewLock, SeatLock};
use crate::payment::{Payment, PaymentStatus};
use crate::settlement::{Settlement, SettlementStatus, SettlementTotals};
use crate::trip::Trip;
use crate::CoreResult;

/// Read/write access to the trip catalog's seat inventory.
#[async_trait]
pub trait TripRepository: Send + Sync {
    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>>;

    /// Insert or replace a trip (catalog sync, fixtures).
    async fn upsert_trip(&self, trip: &Trip) -> CoreResult<()>;
}

/// Seat holds. Every method is atomic with respect to concurrent callers on
/// the same trip, across processes.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Check-then-create under the trip's critical section.
    ///
    /// `NotFound` for an unknown trip, `ValidationError` for seats the trip
    /// does not have, `Conflict` for sold or held seats.
    async fn acquire(&self, request: &NewLock, now: DateTime<Utc>) -> CoreResult<SeatLock>;

    async fn get_lock(&self, id: Uuid) -> CoreResult<Option<SeatLock>>;

    /// HELD -> CONFIRMED, evaluated with [`SeatLock::check_confirm`].
    ///
    /// `clock` is read only once the lock row is held, so a hold that
    /// lapses while this call waits is rejected.
    async fn confirm_lock(
        &self,
        id: Uuid,
        booking_id: Uuid,
        retain_until: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> CoreResult<SeatLock>;

    /// Returns the lock and whether this call changed it.
    async fn release_lock(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(SeatLock, bool)>;

    async fn live_locks(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatLock>>;

    /// Releases up to `limit` HELD/CONFIRMED locks with `expires_at <= now`.
    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>>;
}

/// Everything written when a confirmation is accepted, committed as one unit.
#[derive(Debug, Clone)]
pub struct BookingCommit {
    pub booking: Booking,
    pub payment: Payment,
    pub retain_lock_until: DateTime<Utc>,
}

/// Multi-record transitions on bookings. Each either applies completely or
/// not at all, and reports whether it applied.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Confirms the lock, removes the seats from the trip and inserts the
    /// booking with its PENDING payment. Expiry is checked against `clock`
    /// read inside the critical section.
    async fn commit_booking(&self, commit: &BookingCommit, clock: &dyn Clock) -> CoreResult<()>;

    async fn get_booking(&self, id: Uuid) -> CoreResult<Option<Booking>>;

    async fn get_booking_by_lock(&self, lock_id: Uuid) -> CoreResult<Option<Booking>>;

    /// CONFIRMED -> CANCELLED, releasing the lock and restoring seats.
    async fn cancel_booking(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(Booking, bool)>;

    /// PENDING -> FAILED. A still-CONFIRMED booking is cancelled with its
    /// lock released and seats restored.
    async fn fail_payment(&self, payment_id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<bool>;

    /// Records an accepted refund: the payment moves to `status`
    /// (REFUND_INITIATED or REFUNDED) and the booking to REFUNDED. Seats
    /// come back if the booking still held them.
    async fn complete_refund(
        &self,
        payment_id: Uuid,
        refund_id: &str,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn get_payment(&self, id: Uuid) -> CoreResult<Option<Payment>>;

    async fn get_payment_for_booking(&self, booking_id: Uuid) -> CoreResult<Option<Payment>>;

    async fn find_by_transaction(&self, transaction_id: &str) -> CoreResult<Option<Payment>>;

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>>;

    /// Stores the gateway's ids on a PENDING payment.
    async fn attach_transaction(
        &self,
        id: Uuid,
        transaction_id: &str,
        payment_link: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// PENDING -> PAID. False when the payment was not PENDING.
    async fn mark_paid(
        &self,
        id: Uuid,
        transaction_id: Option<&str>,
        paid_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;

    /// REFUND_INITIATED -> REFUNDED.
    async fn mark_refunded(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool>;

    /// Flags a PAID payment for the refund job. Repeating the request is a
    /// no-op; any other status is a `Conflict`.
    async fn request_refund(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<Payment>;

    async fn fail_refund(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> CoreResult<bool>;

    async fn pending_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>>;

    async fn refund_initiated_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>>;

    async fn refunds_due(&self, limit: i64) -> CoreResult<Vec<Payment>>;

}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    async fn get_record(&self, key: &str, actor_id: &str) -> CoreResult<Option<IdempotencyRecord>>;

    /// Insert-if-absent. False when a record for `(key, actor_id)` exists.
    async fn insert_pending(&self, record: &IdempotencyRecord) -> CoreResult<bool>;

    /// Deletes the record if it is FAILED or expired at `now`.
    async fn remove_stale(&self, key: &str, actor_id: &str, now: DateTime<Utc>) -> CoreResult<bool>;

    async fn complete(
        &self,
        key: &str,
        actor_id: &str,
        status: IdempotencyStatus,
        response: Option<&Value>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn purge_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<u64>;
}

#[async_trait]
pub trait SettlementRepository: Send + Sync {
    /// Per (agency, currency) sums of PAID payments with `paid_at` in
    /// `[start, end)` that are in no settlement, skipping pairs already
    /// settled for a period starting at `start`. At most `limit` groups,
    /// ordered by agency.
    async fn unsettled_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<SettlementTotals>>;

    /// Inserts the settlement and stamps every matching unsettled payment
    /// with it in one unit. The stored totals are recomputed from the rows
    /// actually stamped. `None` when the agency already has a settlement
    /// for this period and currency.
    async fn create_settlement(&self, settlement: &Settlement) -> CoreResult<Option<Settlement>>;

    async fn get_settlement(&self, id: Uuid) -> CoreResult<Option<Settlement>>;

    async fn list_settlements(&self, limit: i64) -> CoreResult<Vec<Settlement>>;

    /// Conditional status change; `None` when the settlement was not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        payout_reference: Option<&str>,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Settlement>>;
}

/// The injected store client, one handle per concern.
#[derive(Clone)]
pub struct Repositories {
    pub trips: Arc<dyn TripRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub bookings: Arc<dyn BookingRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub settlements: Arc<dyn SettlementRepository>,
}
