use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use transita_core::audit::AuditSink;
use transita_core::booking::{validate_contact, validate_passengers, Booking, BookingStatus, ContactInfo, Passenger};
use transita_core::gateway::{Customer, InitiatePayment, PaymentGateway};
use transita_core::lock::{LockGrant, LockStatus};
use transita_core::payment::{Payment, PaymentStatus};
use transita_core::repository::BookingCommit;
use transita_core::{Clock, CoreError, CoreResult, Repositories};
use transita_shared::models::events::{
    AuditEvent, BookingCancelledEvent, BookingConfirmedEvent, LockReleasedEvent, NotificationDueEvent,
};

use crate::finance::split_fare;
use crate::idempotency::IdempotencyGuard;
use crate::locks::LockManager;
use crate::payments::{outcome_from_status, OutcomeSource, PaymentOutcome, PaymentResolver};

const PNR_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const PNR_LEN: usize = 6;

pub const CONFIRM_ENDPOINT: &str = "/v1/bookings/confirm";

/// Who is asking. Guests and signed-in users are both plain holder ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub admin: bool,
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self { id: id.into(), admin: false }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self { id: id.into(), admin: true }
    }

    fn may_act_for(&self, holder_id: &str) -> bool {
        self.admin || self.id == holder_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmRequest {
    pub lock_id: Uuid,
    pub passengers: Vec<Passenger>,
    pub contact: ContactInfo,
    /// Gateway transaction the client already paid with, if any.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingResult {
    pub booking: Booking,
    pub payment: Payment,
    #[serde(default)]
    pub payment_link: Option<String>,
}

pub(crate) fn generate_pnr() -> String {
    let mut rng = rand::thread_rng();
    (0..PNR_LEN)
        .map(|_| PNR_ALPHABET[rng.gen_range(0..PNR_ALPHABET.len())] as char)
        .collect()
}

/// Reserve, confirm, cancel and refund requests, as the API exposes them.
#[derive(Clone)]
pub struct BookingService {
    repos: Repositories,
    locks: LockManager,
    idempotency: IdempotencyGuard,
    payments: PaymentResolver,
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    platform_fee_bps: u32,
    redirect_url: String,
    callback_url: String,
}

impl BookingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        locks: LockManager,
        idempotency: IdempotencyGuard,
        payments: PaymentResolver,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        platform_fee_bps: u32,
        redirect_url: String,
        callback_url: String,
    ) -> Self {
        Self {
            repos,
            locks,
            idempotency,
            payments,
            gateway,
            audit,
            clock,
            platform_fee_bps,
            redirect_url,
            callback_url,
        }
    }

    pub async fn reserve(
        &self,
        caller: &Caller,
        trip_id: Uuid,
        seats: &[String],
        hold_duration: Option<Duration>,
    ) -> CoreResult<LockGrant> {
        self.locks.acquire_lock(trip_id, &caller.id, seats, hold_duration).await
    }

    /// Drops a hold before it lapses. Only the holder sees the lock.
    pub async fn release_hold(&self, caller: &Caller, lock_id: Uuid) -> CoreResult<bool> {
        let lock = self.locks.get_lock(lock_id).await?;
        if !caller.may_act_for(&lock.holder_id) {
            return Err(CoreError::NotFound(format!("lock {}", lock_id)));
        }
        if lock.status == LockStatus::Confirmed {
            return Err(CoreError::Conflict("lock belongs to a booking; cancel the booking instead".to_string()));
        }
        self.locks.release_lock(lock_id, "released by holder").await
    }

    /// [`BookingService::confirm`] behind the idempotency guard. A retry
    /// with the same key and body gets the first result back.
    pub async fn confirm_idempotent(
        &self,
        caller: &Caller,
        idempotency_key: &str,
        request: ConfirmRequest,
    ) -> CoreResult<BookingResult> {
        let payload = serde_json::to_value(&request)
            .map_err(|e| CoreError::InternalError(format!("failed to encode request: {}", e)))?;

        let response = self
            .idempotency
            .execute(idempotency_key, &caller.id, "POST", CONFIRM_ENDPOINT, &payload, || async {
                let result = self.confirm(caller, request).await?;
                serde_json::to_value(&result)
                    .map_err(|e| CoreError::InternalError(format!("failed to encode booking: {}", e)))
            })
            .await?;

        decode_result(response)
    }

    /// Turns a live hold into a booking with a PENDING payment, then asks
    /// the gateway once. Gateway trouble never fails the confirmation.
    pub async fn confirm(&self, caller: &Caller, request: ConfirmRequest) -> CoreResult<BookingResult> {
        let lock = self.locks.get_lock(request.lock_id).await?;
        if lock.holder_id != caller.id {
            return Err(CoreError::NotFound(format!("lock {}", request.lock_id)));
        }
        if lock.status == LockStatus::Confirmed {
            // An earlier attempt committed but failed afterwards; hand back what it made.
            if let Some(existing) = self.repos.bookings.get_booking_by_lock(lock.id).await? {
                info!(booking_id = %existing.id, lock_id = %lock.id, "lock already booked, returning existing booking");
                let payment = self.load_payment_for(existing.id).await?;
                let payment_link = payment.payment_link.clone();
                return Ok(BookingResult { booking: existing, payment, payment_link });
            }
        }

        let booking_id = Uuid::new_v4();
        let now = self.clock.now();
        lock.check_confirm(booking_id, now)?;
        validate_passengers(&request.passengers, &lock.seat_numbers)?;
        validate_contact(&request.contact)?;
        self.locks.ensure_exclusive(&lock).await?;

        let trip = self
            .repos
            .trips
            .get_trip(lock.trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", lock.trip_id)))?;
        if trip.departs_at <= now {
            return Err(CoreError::Conflict("trip has already departed".to_string()));
        }

        let split = split_fare(trip.fare_amount, lock.seat_numbers.len(), self.platform_fee_bps)?;
        let transaction_id = request
            .transaction_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let payment = Payment::pending(
            booking_id,
            trip.agency_id,
            split.amount,
            split.platform_fee,
            &trip.currency,
            transaction_id.clone(),
            now,
        );
        let booking = Booking {
            id: booking_id,
            pnr: generate_pnr(),
            trip_id: trip.id,
            lock_id: lock.id,
            holder_id: lock.holder_id.clone(),
            passengers: request.passengers,
            contact: request.contact,
            total_amount: split.amount,
            currency: trip.currency.clone(),
            payment_status: PaymentStatus::Pending,
            status: BookingStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };

        let commit = BookingCommit {
            booking: booking.clone(),
            payment: payment.clone(),
            retain_lock_until: trip.departs_at,
        };
        self.repos.bookings.commit_booking(&commit, self.clock.as_ref()).await?;
        info!(booking_id = %booking.id, pnr = %booking.pnr, lock_id = %lock.id, "booking confirmed, payment pending");
        self.publish_confirmed(&booking).await;

        let payment_link = match transaction_id {
            Some(tx) => {
                self.verify_now(&payment, &tx).await?;
                None
            }
            None => self.initiate(&booking, &payment).await?,
        };

        let payment = self
            .repos
            .payments
            .get_payment(payment.id)
            .await?
            .ok_or_else(|| CoreError::InternalError(format!("payment {} vanished", payment.id)))?;
        let booking = self.load_booking(booking.id).await?;

        if payment.status == PaymentStatus::Failed {
            return Err(CoreError::PaymentError(
                payment.failure_reason.unwrap_or_else(|| "payment declined".to_string()),
            ));
        }
        Ok(BookingResult { booking, payment, payment_link })
    }

    async fn verify_now(&self, payment: &Payment, transaction_id: &str) -> CoreResult<()> {
        let verification = match self.gateway.verify(&payment.reference, Some(transaction_id)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(payment_id = %payment.id, "verification inconclusive, leaving PENDING: {}", e);
                return Ok(());
            }
        };

        let mut outcome = outcome_from_status(
            &verification.status,
            verification.transaction_id.clone().or_else(|| Some(transaction_id.to_string())),
            verification.paid_at,
            None,
            false,
        );
        if matches!(outcome, PaymentOutcome::Paid { .. }) && verification.amount < payment.amount {
            warn!(
                payment_id = %payment.id,
                expected = payment.amount,
                received = verification.amount,
                "verified amount does not cover the booking"
            );
            outcome = PaymentOutcome::Unresolved;
        }
        self.payments.apply(payment, outcome, OutcomeSource::Verify).await?;
        Ok(())
    }

    async fn initiate(&self, booking: &Booking, payment: &Payment) -> CoreResult<Option<String>> {
        let name = booking
            .passengers
            .first()
            .map(|p| p.full_name.clone())
            .unwrap_or_default();
        let request = InitiatePayment {
            amount: payment.amount,
            currency: payment.currency.clone(),
            reference: payment.reference.clone(),
            customer: Customer {
                name,
                email: booking.contact.email.clone(),
                phone: booking.contact.phone.clone(),
            },
            redirect_url: self.redirect_url.clone(),
            callback_url: self.callback_url.clone(),
        };

        match self.gateway.initiate(&request).await {
            Ok(link) => {
                self.repos
                    .payments
                    .attach_transaction(payment.id, &link.transaction_id, Some(&link.payment_link), self.clock.now())
                    .await?;
                Ok(Some(link.payment_link))
            }
            Err(e) => {
                // Reconciliation looks the charge up by reference later.
                warn!(payment_id = %payment.id, "payment initiation failed, leaving PENDING: {}", e);
                Ok(None)
            }
        }
    }

    /// CONFIRMED -> CANCELLED. Seats go back on sale; money already taken
    /// is flagged for the refund job.
    pub async fn cancel(&self, caller: &Caller, booking_id: Uuid) -> CoreResult<BookingResult> {
        let booking = self.load_booking(booking_id).await?;
        if !caller.may_act_for(&booking.holder_id) {
            return Err(CoreError::NotFound(format!("booking {}", booking_id)));
        }
        if booking.status == BookingStatus::Refunded {
            return Err(CoreError::Conflict("booking has already been refunded".to_string()));
        }

        let now = self.clock.now();
        let (booking, changed) = self.repos.bookings.cancel_booking(booking_id, now).await?;
        if changed {
            info!(booking_id = %booking.id, pnr = %booking.pnr, "booking cancelled");
            self.publish_cancelled(&booking, "cancelled by customer").await;
        }

        let mut payment = self.load_payment_for(booking_id).await?;
        if payment.status == PaymentStatus::Paid && !payment.refund_requested {
            payment = self
                .repos
                .payments
                .request_refund(payment.id, "booking cancelled", now)
                .await?;
        }
        Ok(BookingResult { booking, payment, payment_link: None })
    }

    /// Flags a PAID payment for the refund job.
    pub async fn request_refund(&self, caller: &Caller, payment_id: Uuid, reason: &str) -> CoreResult<Payment> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::ValidationError("refund reason is required".to_string()));
        }
        let payment = self
            .repos
            .payments
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", payment_id)))?;
        let booking = self.load_booking(payment.booking_id).await?;
        if !caller.may_act_for(&booking.holder_id) {
            return Err(CoreError::NotFound(format!("payment {}", payment_id)));
        }

        let payment = self.repos.payments.request_refund(payment_id, reason, self.clock.now()).await?;
        info!(payment_id = %payment.id, "refund requested");
        Ok(payment)
    }

    pub async fn get(&self, caller: &Caller, booking_id: Uuid) -> CoreResult<BookingResult> {
        let booking = self.load_booking(booking_id).await?;
        if !caller.may_act_for(&booking.holder_id) {
            return Err(CoreError::NotFound(format!("booking {}", booking_id)));
        }
        let payment = self.load_payment_for(booking_id).await?;
        let payment_link = payment.payment_link.clone();
        Ok(BookingResult { booking, payment, payment_link })
    }

    async fn load_booking(&self, id: Uuid) -> CoreResult<Booking> {
        self.repos
            .bookings
            .get_booking(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", id)))
    }

    async fn load_payment_for(&self, booking_id: Uuid) -> CoreResult<Payment> {
        self.repos
            .payments
            .get_payment_for_booking(booking_id)
            .await?
            .ok_or_else(|| CoreError::InternalError(format!("booking {} has no payment", booking_id)))
    }

    async fn publish_confirmed(&self, booking: &Booking) {
        let now = self.clock.now().timestamp();
        self.audit
            .publish(AuditEvent::BookingConfirmed(BookingConfirmedEvent {
                booking_id: booking.id,
                pnr: booking.pnr.clone(),
                trip_id: booking.trip_id,
                lock_id: booking.lock_id,
                seat_numbers: booking.seat_numbers(),
                total_amount: booking.total_amount,
                currency: booking.currency.clone(),
                timestamp: now,
            }))
            .await;
        self.audit
            .publish(AuditEvent::NotificationDue(NotificationDueEvent {
                booking_id: booking.id,
                pnr: booking.pnr.clone(),
                template: "booking_confirmed".to_string(),
                timestamp: now,
            }))
            .await;
    }

    async fn publish_cancelled(&self, booking: &Booking, reason: &str) {
        let now = self.clock.now().timestamp();
        self.audit
            .publish(AuditEvent::LockReleased(LockReleasedEvent {
                lock_id: booking.lock_id,
                trip_id: booking.trip_id,
                reason: "booking cancelled".to_string(),
                timestamp: now,
            }))
            .await;
        self.audit
            .publish(AuditEvent::BookingCancelled(BookingCancelledEvent {
                booking_id: booking.id,
                pnr: booking.pnr.clone(),
                trip_id: booking.trip_id,
                reason: reason.to_string(),
                timestamp: now,
            }))
            .await;
        self.audit
            .publish(AuditEvent::NotificationDue(NotificationDueEvent {
                booking_id: booking.id,
                pnr: booking.pnr.clone(),
                template: "booking_cancelled".to_string(),
                timestamp: now,
            }))
            .await;
    }
}

fn decode_result(value: Value) -> CoreResult<BookingResult> {
    serde_json::from_value(value)
        .map_err(|e| CoreError::InternalError(format!("stored booking response is unreadable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{contact, passengers, seats, TestEngine};
    use transita_core::gateway::{GatewayError, GatewayStatus};
    use transita_core::idempotency::{request_hash, IdempotencyRecord, IdempotencyStatus};

    #[test]
    fn test_pnr_shape() {
        let pnr = generate_pnr();
        assert_eq!(pnr.len(), PNR_LEN);
        assert!(pnr.bytes().all(|b| PNR_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_confirm_replay_returns_same_booking() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2", "3"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1", "2"]), None).await.unwrap();

        let request = ConfirmRequest {
            lock_id: grant.lock_id,
            passengers: passengers(&[("Ada Obi", "1"), ("Femi Obi", "2")]),
            contact: contact(),
            transaction_id: None,
        };
        let first = t.engine.bookings.confirm_idempotent(&caller, "key-1", request.clone()).await.unwrap();
        let again = t.engine.bookings.confirm_idempotent(&caller, "key-1", request.clone()).await.unwrap();

        assert_eq!(first.booking.pnr, again.booking.pnr);
        assert_eq!(first.booking.id, again.booking.id);
        assert_eq!(t.audit.count_topic("booking.confirmed"), 1);

        let mut changed = request;
        changed.passengers.swap(0, 1);
        changed.passengers[0].full_name = "Someone Else".to_string();
        let err = t.engine.bookings.confirm_idempotent(&caller, "key-1", changed).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_retry_after_post_commit_failure_returns_committed_booking() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1"]), None).await.unwrap();
        let request = ConfirmRequest {
            lock_id: grant.lock_id,
            passengers: passengers(&[("Ada Obi", "1")]),
            contact: contact(),
            transaction_id: None,
        };

        // First attempt: the booking is committed but the key ends up FAILED.
        let committed = t.engine.bookings.confirm(&caller, request.clone()).await.unwrap();
        let now = t.clock.now();
        let hash = request_hash("POST", CONFIRM_ENDPOINT, &serde_json::to_value(&request).unwrap());
        let record = IdempotencyRecord::pending("key-1", &caller.id, "POST", CONFIRM_ENDPOINT, hash, now + Duration::hours(24), now);
        assert!(t.engine.repos.idempotency.insert_pending(&record).await.unwrap());
        t.engine
            .repos
            .idempotency
            .complete("key-1", &caller.id, IdempotencyStatus::Failed, None, Some("storage unavailable"), now)
            .await
            .unwrap();

        let retried = t.engine.bookings.confirm_idempotent(&caller, "key-1", request).await.unwrap();
        assert_eq!(retried.booking.id, committed.booking.id);
        assert_eq!(retried.booking.pnr, committed.booking.pnr);
        assert_eq!(retried.payment.id, committed.payment.id);
        assert_eq!(retried.payment_link, committed.payment.payment_link);
        assert_eq!(t.audit.count_topic("booking.confirmed"), 1);

        let stored = t.engine.repos.trips.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(stored.available_seats, seats(&["2"]));
    }

    #[tokio::test]
    async fn test_confirm_sells_seats_and_splits_fare() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2", "3"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1", "3"]), None).await.unwrap();

        let result = t
            .engine
            .bookings
            .confirm(
                &caller,
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1"), ("Femi Obi", "3")]),
                    contact: contact(),
                    transaction_id: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.booking.total_amount, 2 * trip.fare_amount);
        assert_eq!(result.payment.platform_fee, result.booking.total_amount * 500 / 10_000);
        assert_eq!(result.payment.status, PaymentStatus::Pending);
        assert!(result.payment_link.is_some());
        assert!(result.payment.transaction_id.is_some());

        let stored = t.engine.repos.trips.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(stored.available_seats, seats(&["2"]));
        let lock = t.engine.repos.locks.get_lock(grant.lock_id).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Confirmed);
        assert_eq!(lock.expires_at, trip.departs_at);
    }

    #[tokio::test]
    async fn test_confirm_with_paid_transaction_marks_paid() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1"]), None).await.unwrap();
        let tx = t.sandbox.register_charge("client-ref", trip.fare_amount, "NGN", GatewayStatus::Successful);

        let result = t
            .engine
            .bookings
            .confirm(
                &caller,
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1")]),
                    contact: contact(),
                    transaction_id: Some(tx.clone()),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.payment.status, PaymentStatus::Paid);
        assert_eq!(result.booking.payment_status, PaymentStatus::Paid);
        assert_eq!(result.payment.transaction_id.as_deref(), Some(tx.as_str()));
    }

    #[tokio::test]
    async fn test_expired_lock_cannot_be_confirmed_before_sweep() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1"]), None).await.unwrap();

        t.clock.advance(Duration::minutes(15));
        let err = t
            .engine
            .bookings
            .confirm(
                &caller,
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1")]),
                    contact: contact(),
                    transaction_id: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(t.engine.repos.bookings.get_booking_by_lock(grant.lock_id).await.unwrap().is_none());
        let stored = t.engine.repos.trips.get_trip(trip.id).await.unwrap().unwrap();
        assert!(stored.is_available("1"));
    }

    #[tokio::test]
    async fn test_gateway_timeout_leaves_payment_pending() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1"]), None).await.unwrap();
        let tx = t.sandbox.register_charge("client-ref", trip.fare_amount, "NGN", GatewayStatus::Successful);
        t.sandbox.set_latency(std::time::Duration::from_millis(300));

        let result = t
            .engine
            .bookings
            .confirm(
                &caller,
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1")]),
                    contact: contact(),
                    transaction_id: Some(tx),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.payment.status, PaymentStatus::Pending);
        assert_eq!(result.booking.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_failed_initiation_still_confirms() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1"]).await;
        let caller = t.holder();
        let grant = t.engine.bookings.reserve(&caller, trip.id, &seats(&["1"]), None).await.unwrap();
        t.sandbox.fail_next(GatewayError::Transport("connection reset".to_string()));

        let result = t
            .engine
            .bookings
            .confirm(
                &caller,
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1")]),
                    contact: contact(),
                    transaction_id: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.payment.status, PaymentStatus::Pending);
        assert!(result.payment.transaction_id.is_none());
        assert!(result.payment_link.is_none());
    }

    #[tokio::test]
    async fn test_only_the_holder_can_confirm() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1"]).await;
        let grant = t.engine.bookings.reserve(&t.holder(), trip.id, &seats(&["1"]), None).await.unwrap();

        let err = t
            .engine
            .bookings
            .confirm(
                &Caller::user("intruder"),
                ConfirmRequest {
                    lock_id: grant.lock_id,
                    passengers: passengers(&[("Ada Obi", "1")]),
                    contact: contact(),
                    transaction_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_restores_seats_and_flags_refund() {
        let t = TestEngine::new().await;
        let confirmed = t.confirmed_booking(&["1", "2"]).await;
        let tx = confirmed.payment.transaction_id.clone().unwrap();
        t.sandbox.settle(&tx, GatewayStatus::Successful);
        t.engine
            .payments
            .apply(
                &confirmed.payment,
                PaymentOutcome::Paid { transaction_id: Some(tx), paid_at: None },
                OutcomeSource::Webhook,
            )
            .await
            .unwrap();

        let cancelled = t.engine.bookings.cancel(&t.holder(), confirmed.booking.id).await.unwrap();
        assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
        assert!(cancelled.payment.refund_due());

        let trip = t.engine.repos.trips.get_trip(confirmed.booking.trip_id).await.unwrap().unwrap();
        assert!(trip.is_available("1") && trip.is_available("2"));

        let again = t.engine.bookings.cancel(&t.holder(), confirmed.booking.id).await.unwrap();
        assert_eq!(again.booking.status, BookingStatus::Cancelled);
        assert_eq!(t.audit.count_topic("booking.cancelled"), 1);
    }

    #[tokio::test]
    async fn test_refund_request_needs_a_paid_payment() {
        let t = TestEngine::new().await;
        let confirmed = t.confirmed_booking(&["1"]).await;

        let err = t
            .engine
            .bookings
            .request_refund(&t.holder(), confirmed.payment.id, "changed plans")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let err = t
            .engine
            .bookings
            .request_refund(&Caller::user("stranger"), confirmed.payment.id, "changed plans")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_hold_is_holder_scoped() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1"]).await;
        let grant = t.engine.bookings.reserve(&t.holder(), trip.id, &seats(&["1"]), None).await.unwrap();

        let err = t.engine.bookings.release_hold(&Caller::user("other"), grant.lock_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(t.engine.bookings.release_hold(&t.holder(), grant.lock_id).await.unwrap());
        assert!(t.engine.locks.are_seats_available(trip.id, &seats(&["1"])).await.unwrap());
    }
}
