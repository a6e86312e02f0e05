//! Single-process store behind one async mutex. Each trait method runs
//! entirely under the lock, so every composite transition is atomic the
//! way the Postgres transactions are.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use transita_core::booking::{Booking, BookingStatus};
use transita_core::clock::Clock;
use transita_core::idempotency::{IdempotencyRecord, IdempotencyStatus};
use transita_core::lock::{check_acquirable, ConfirmAction, LockStatus, NewLock, SeatLock};
use transita_core::payment::{Payment, PaymentStatus, RefundStatus};
use transita_core::repository::{
    BookingCommit, BookingRepository, IdempotencyRepository, LockRepository, PaymentRepository, Repositories,
    SettlementRepository, TripRepository,
};
use transita_core::settlement::{Settlement, SettlementStatus, SettlementTotals};
use transita_core::trip::Trip;
use transita_core::{CoreError, CoreResult};

#[derive(Default)]
struct MemoryState {
    trips: HashMap<Uuid, Trip>,
    locks: HashMap<Uuid, SeatLock>,
    bookings: HashMap<Uuid, Booking>,
    payments: HashMap<Uuid, Payment>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    settlements: HashMap<Uuid, Settlement>,
}

impl MemoryState {
    fn free_booking_seats(&mut self, booking: &Booking, now: DateTime<Utc>) {
        if let Some(lock) = self.locks.get_mut(&booking.lock_id) {
            lock.release(now);
        }
        if let Some(trip) = self.trips.get_mut(&booking.trip_id) {
            trip.restore_seats(&booking.seat_numbers());
        }
    }

    fn unsettled_in(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = &Payment> + '_ {
        self.payments.values().filter(move |p| {
            p.status == PaymentStatus::Paid
                && p.settlement_id.is_none()
                && p.paid_at.is_some_and(|at| at >= start && at < end)
        })
    }

    fn has_settlement(&self, agency_id: Uuid, period_start: DateTime<Utc>, currency: &str) -> bool {
        self.settlements
            .values()
            .any(|s| s.agency_id == agency_id && s.period_start == period_start && s.currency == currency)
    }

    fn set_booking_payment_status(&mut self, booking_id: Uuid, status: PaymentStatus, now: DateTime<Utc>) {
        if let Some(booking) = self.bookings.get_mut(&booking_id) {
            booking.payment_status = status;
            booking.updated_at = now;
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The same store behind every repository handle.
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            trips: self.clone(),
            locks: self.clone(),
            bookings: self.clone(),
            payments: self.clone(),
            idempotency: self.clone(),
            settlements: self.clone(),
        }
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

fn take(items: Vec<Payment>, limit: i64) -> Vec<Payment> {
    items.into_iter().take(limit.max(0) as usize).collect()
}

#[async_trait]
impl TripRepository for MemoryStore {
    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>> {
        Ok(self.state.lock().await.trips.get(&id).cloned())
    }

    async fn upsert_trip(&self, trip: &Trip) -> CoreResult<()> {
        self.state.lock().await.trips.insert(trip.id, trip.clone());
        Ok(())
    }
}

#[async_trait]
impl LockRepository for MemoryStore {
    async fn acquire(&self, request: &NewLock, now: DateTime<Utc>) -> CoreResult<SeatLock> {
        let mut state = self.state.lock().await;
        let trip = state
            .trips
            .get(&request.trip_id)
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", request.trip_id)))?;

        let live: Vec<SeatLock> = state
            .locks
            .values()
            .filter(|l| l.trip_id == request.trip_id && l.is_live(now))
            .cloned()
            .collect();
        check_acquirable(trip, &live, &request.seat_numbers, now)?;

        let lock = SeatLock::held(request, now);
        state.locks.insert(lock.id, lock.clone());
        Ok(lock)
    }

    async fn get_lock(&self, id: Uuid) -> CoreResult<Option<SeatLock>> {
        Ok(self.state.lock().await.locks.get(&id).cloned())
    }

    async fn confirm_lock(
        &self,
        id: Uuid,
        booking_id: Uuid,
        retain_until: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> CoreResult<SeatLock> {
        let mut state = self.state.lock().await;
        let now = clock.now();
        let lock = state
            .locks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", id)))?;
        if lock.check_confirm(booking_id, now)? == ConfirmAction::Confirm {
            lock.confirm(booking_id, retain_until, now);
        }
        Ok(lock.clone())
    }

    async fn release_lock(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(SeatLock, bool)> {
        let mut state = self.state.lock().await;
        let lock = state
            .locks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", id)))?;
        let changed = lock.release(now);
        Ok((lock.clone(), changed))
    }

    async fn live_locks(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatLock>> {
        let state = self.state.lock().await;
        let live: Vec<SeatLock> = state
            .locks
            .values()
            .filter(|l| l.trip_id == trip_id && l.is_live(now))
            .cloned()
            .collect();
        Ok(sorted_by(live, |l| l.created_at))
    }

    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .locks
            .values()
            .filter(|l| l.status != LockStatus::Released && l.expires_at <= now)
            .map(|l| (l.expires_at, l.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut released = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(lock) = state.locks.get_mut(&id) {
                lock.release(now);
                released.push(lock.clone());
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl BookingRepository for MemoryStore {
    async fn commit_booking(&self, commit: &BookingCommit, clock: &dyn Clock) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let now = clock.now();
        let booking = &commit.booking;

        let lock = state
            .locks
            .get(&booking.lock_id)
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", booking.lock_id)))?;
        if lock.check_confirm(booking.id, now)? == ConfirmAction::AlreadyConfirmed {
            return Ok(());
        }
        let (trip_id, seats) = (lock.trip_id, lock.seat_numbers.clone());

        // Validate against a copy first so a rejected commit leaves nothing behind.
        let mut trip = state
            .trips
            .get(&trip_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
        trip.remove_seats(&seats)?;
        state.trips.insert(trip_id, trip);

        if let Some(lock) = state.locks.get_mut(&booking.lock_id) {
            lock.confirm(booking.id, commit.retain_lock_until, now);
        }
        state.bookings.insert(booking.id, booking.clone());
        state.payments.insert(commit.payment.id, commit.payment.clone());
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> CoreResult<Option<Booking>> {
        Ok(self.state.lock().await.bookings.get(&id).cloned())
    }

    async fn get_booking_by_lock(&self, lock_id: Uuid) -> CoreResult<Option<Booking>> {
        let state = self.state.lock().await;
        Ok(state.bookings.values().find(|b| b.lock_id == lock_id).cloned())
    }

    async fn cancel_booking(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(Booking, bool)> {
        let mut state = self.state.lock().await;
        let booking = state
            .bookings
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", id)))?;
        if booking.status != BookingStatus::Confirmed {
            return Ok((booking.clone(), false));
        }
        booking.status = BookingStatus::Cancelled;
        booking.updated_at = now;
        let booking = booking.clone();
        state.free_booking_seats(&booking, now);
        Ok((booking, true))
    }

    async fn fail_payment(&self, payment_id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", payment_id)))?;
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_string());
        payment.updated_at = now;
        let booking_id = payment.booking_id;

        if let Some(booking) = state.bookings.get_mut(&booking_id) {
            let held_seats = booking.status == BookingStatus::Confirmed;
            booking.payment_status = PaymentStatus::Failed;
            if held_seats {
                booking.status = BookingStatus::Cancelled;
            }
            booking.updated_at = now;
            let booking = booking.clone();
            if held_seats {
                state.free_booking_seats(&booking, now);
            }
        }
        Ok(true)
    }

    async fn complete_refund(
        &self,
        payment_id: Uuid,
        refund_id: &str,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", payment_id)))?;
        if !payment.refund_due() {
            return Ok(false);
        }
        payment.status = status;
        payment.refund_id = Some(refund_id.to_string());
        payment.refund_status = Some(RefundStatus::Processed);
        payment.refund_error = None;
        payment.updated_at = now;
        let booking_id = payment.booking_id;

        if let Some(booking) = state.bookings.get_mut(&booking_id) {
            let held_seats = booking.status == BookingStatus::Confirmed;
            booking.status = BookingStatus::Refunded;
            booking.payment_status = status;
            booking.updated_at = now;
            let booking = booking.clone();
            if held_seats {
                state.free_booking_seats(&booking, now);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl PaymentRepository for MemoryStore {
    async fn get_payment(&self, id: Uuid) -> CoreResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn get_payment_for_booking(&self, booking_id: Uuid) -> CoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().find(|p| p.booking_id == booking_id).cloned())
    }

    async fn find_by_transaction(&self, transaction_id: &str) -> CoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state.payments.values().find(|p| p.reference == reference).cloned())
    }

    async fn attach_transaction(
        &self,
        id: Uuid,
        transaction_id: &str,
        payment_link: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(payment) = state.payments.get_mut(&id) {
            if payment.status == PaymentStatus::Pending {
                payment.transaction_id = Some(transaction_id.to_string());
                if let Some(link) = payment_link {
                    payment.payment_link = Some(link.to_string());
                }
                payment.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_paid(
        &self,
        id: Uuid,
        transaction_id: Option<&str>,
        paid_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(&id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        payment.status = PaymentStatus::Paid;
        if payment.transaction_id.is_none() {
            payment.transaction_id = transaction_id.map(str::to_string);
        }
        payment.paid_at = Some(paid_at);
        payment.updated_at = now;
        let booking_id = payment.booking_id;
        state.set_booking_payment_status(booking_id, PaymentStatus::Paid, now);
        Ok(true)
    }

    async fn mark_refunded(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(&id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::RefundInitiated {
            return Ok(false);
        }
        payment.status = PaymentStatus::Refunded;
        payment.updated_at = now;
        let booking_id = payment.booking_id;
        state.set_booking_payment_status(booking_id, PaymentStatus::Refunded, now);
        Ok(true)
    }

    async fn request_refund(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> CoreResult<Payment> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("payment {}", id)))?;
        if payment.status != PaymentStatus::Paid {
            return Err(CoreError::Conflict(format!(
                "payment {} is {} and cannot be refunded",
                id,
                payment.status.as_str()
            )));
        }
        if !payment.refund_requested {
            payment.refund_requested = true;
            payment.refund_reason = Some(reason.to_string());
            payment.refund_status = Some(RefundStatus::Requested);
            payment.updated_at = now;
        }
        Ok(payment.clone())
    }

    async fn fail_refund(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.payments.get_mut(&id) {
            Some(payment) if payment.refund_status == Some(RefundStatus::Requested) => {
                payment.refund_status = Some(RefundStatus::Failed);
                payment.refund_error = Some(error.to_string());
                payment.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let pending: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at <= cutoff)
            .cloned()
            .collect();
        Ok(take(sorted_by(pending, |p| p.created_at), limit))
    }

    async fn refund_initiated_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let initiated: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::RefundInitiated && p.updated_at <= cutoff)
            .cloned()
            .collect();
        Ok(take(sorted_by(initiated, |p| p.updated_at), limit))
    }

    async fn refunds_due(&self, limit: i64) -> CoreResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let due: Vec<Payment> = state.payments.values().filter(|p| p.refund_due()).cloned().collect();
        Ok(take(sorted_by(due, |p| p.updated_at), limit))
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStore {
    async fn get_record(&self, key: &str, actor_id: &str) -> CoreResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().await;
        Ok(state.idempotency.get(&(key.to_string(), actor_id.to_string())).cloned())
    }

    async fn insert_pending(&self, record: &IdempotencyRecord) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let slot = (record.key.clone(), record.actor_id.clone());
        if state.idempotency.contains_key(&slot) {
            return Ok(false);
        }
        state.idempotency.insert(slot, record.clone());
        Ok(true)
    }

    async fn remove_stale(&self, key: &str, actor_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        let slot = (key.to_string(), actor_id.to_string());
        let stale = state
            .idempotency
            .get(&slot)
            .is_some_and(|r| r.status == IdempotencyStatus::Failed || r.is_expired(now));
        if stale {
            state.idempotency.remove(&slot);
        }
        Ok(stale)
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
        let mut state = self.state.lock().await;
        if let Some(record) = state.idempotency.get_mut(&(key.to_string(), actor_id.to_string())) {
            if record.status == IdempotencyStatus::Pending {
                record.status = status;
                record.response_data = response.cloned();
                record.error = error.map(str::to_string);
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<u64> {
        let mut state = self.state.lock().await;
        let expired: Vec<(String, String)> = state
            .idempotency
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(slot, _)| slot.clone())
            .take(limit.max(0) as usize)
            .collect();
        for slot in &expired {
            state.idempotency.remove(slot);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl SettlementRepository for MemoryStore {
    async fn unsettled_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<SettlementTotals>> {
        let state = self.state.lock().await;
        let mut groups: BTreeMap<(Uuid, String), SettlementTotals> = BTreeMap::new();
        for p in state.unsettled_in(start, end) {
            if state.has_settlement(p.agency_id, start, &p.currency) {
                continue;
            }
            let totals = groups
                .entry((p.agency_id, p.currency.clone()))
                .or_insert_with(|| SettlementTotals {
                    agency_id: p.agency_id,
                    currency: p.currency.clone(),
                    gross_amount: 0,
                    fee_amount: 0,
                    net_amount: 0,
                    payment_count: 0,
                });
            totals.gross_amount += p.amount;
            totals.fee_amount += p.platform_fee;
            totals.net_amount += p.agency_amount;
            totals.payment_count += 1;
        }
        Ok(groups.into_values().take(limit.max(0) as usize).collect())
    }

    async fn create_settlement(&self, settlement: &Settlement) -> CoreResult<Option<Settlement>> {
        let mut state = self.state.lock().await;
        if state.has_settlement(settlement.agency_id, settlement.period_start, &settlement.currency) {
            return Ok(None);
        }

        let ids: Vec<Uuid> = state
            .unsettled_in(settlement.period_start, settlement.period_end)
            .filter(|p| p.agency_id == settlement.agency_id && p.currency == settlement.currency)
            .map(|p| p.id)
            .collect();
        if ids.is_empty() {
            return Err(CoreError::Conflict(format!(
                "no unsettled payments left for agency {} in {}",
                settlement.agency_id, settlement.currency
            )));
        }

        let mut stored = settlement.clone();
        stored.gross_amount = 0;
        stored.fee_amount = 0;
        stored.net_amount = 0;
        stored.payment_count = 0;
        for id in &ids {
            if let Some(payment) = state.payments.get_mut(id) {
                payment.settlement_id = Some(settlement.id);
                stored.gross_amount += payment.amount;
                stored.fee_amount += payment.platform_fee;
                stored.net_amount += payment.agency_amount;
                stored.payment_count += 1;
            }
        }
        state.settlements.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn get_settlement(&self, id: Uuid) -> CoreResult<Option<Settlement>> {
        Ok(self.state.lock().await.settlements.get(&id).cloned())
    }

    async fn list_settlements(&self, limit: i64) -> CoreResult<Vec<Settlement>> {
        let state = self.state.lock().await;
        let mut all: Vec<Settlement> = state.settlements.values().cloned().collect();
        all.sort_by(|a, b| b.period_start.cmp(&a.period_start).then(b.created_at.cmp(&a.created_at)));
        all.truncate(limit.max(0) as usize);
        Ok(all)
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
        let mut state = self.state.lock().await;
        match state.settlements.get_mut(&id) {
            Some(settlement) if settlement.status == from => {
                settlement.status = to;
                if let Some(reference) = payout_reference {
                    settlement.payout_reference = Some(reference.to_string());
                }
                if let Some(reason) = failure_reason {
                    settlement.failure_reason = Some(reason.to_string());
                }
                settlement.updated_at = now;
                Ok(Some(settlement.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use transita_core::booking::{ContactInfo, Passenger};
    use transita_core::clock::ManualClock;
    use transita_core::settlement::SettlementPeriod;
    use transita_shared::Masked;

    fn seats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded() -> (Arc<MemoryStore>, Trip, DateTime<Utc>) {
        let store = MemoryStore::new();
        let now = Utc::now();
        let trip = Trip::new(Uuid::new_v4(), seats(&["1A", "1B", "2A", "2B"]), 5_000, "NGN", now + Duration::days(2));
        store.upsert_trip(&trip).await.unwrap();
        (store, trip, now)
    }

    fn hold(trip: &Trip, list: &[&str], now: DateTime<Utc>) -> NewLock {
        NewLock {
            trip_id: trip.id,
            holder_id: "holder-1".to_string(),
            seat_numbers: seats(list),
            expires_at: now + Duration::minutes(15),
        }
    }

    fn commit_for(lock: &SeatLock, trip: &Trip, now: DateTime<Utc>) -> BookingCommit {
        let booking_id = Uuid::new_v4();
        let booking = Booking {
            id: booking_id,
            pnr: "TRN4K2".to_string(),
            trip_id: trip.id,
            lock_id: lock.id,
            holder_id: lock.holder_id.clone(),
            passengers: lock
                .seat_numbers
                .iter()
                .map(|s| Passenger { full_name: "Ada Obi".to_string(), seat_number: s.clone() })
                .collect(),
            contact: ContactInfo { email: Masked::new("ada@example.com".to_string()), phone: None },
            total_amount: 10_000,
            currency: "NGN".to_string(),
            payment_status: PaymentStatus::Pending,
            status: BookingStatus::Confirmed,
            created_at: now,
            updated_at: now,
        };
        let payment = Payment::pending(booking_id, trip.agency_id, 10_000, 500, "NGN", None, now);
        BookingCommit { booking, payment, retain_lock_until: trip.departs_at }
    }

    #[tokio::test]
    async fn test_acquire_rejects_overlap_until_expiry() {
        let (store, trip, now) = seeded().await;
        store.acquire(&hold(&trip, &["1A", "1B"], now), now).await.unwrap();

        let err = store.acquire(&hold(&trip, &["1B", "2A"], now), now).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        // Logically expired locks no longer block, swept or not.
        let later = now + Duration::minutes(16);
        store.acquire(&hold(&trip, &["1B", "2A"], later), later).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_then_cancel_restores_seats() {
        let (store, trip, now) = seeded().await;
        let lock = store.acquire(&hold(&trip, &["2A", "2B"], now), now).await.unwrap();
        let commit = commit_for(&lock, &trip, now);
        store.commit_booking(&commit, &ManualClock::new(now)).await.unwrap();

        let sold = store.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(sold.available_seats, seats(&["1A", "1B"]));
        let confirmed = store.get_lock(lock.id).await.unwrap().unwrap();
        assert_eq!(confirmed.status, LockStatus::Confirmed);
        assert_eq!(confirmed.expires_at, trip.departs_at);

        let (cancelled, changed) = store.cancel_booking(commit.booking.id, now).await.unwrap();
        assert!(changed);
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        let restored = store.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(restored.available_seats, trip.seat_numbers);

        let (_, again) = store.cancel_booking(commit.booking.id, now).await.unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_commit_on_expired_lock_changes_nothing() {
        let (store, trip, now) = seeded().await;
        let lock = store.acquire(&hold(&trip, &["1A"], now), now).await.unwrap();
        let later = ManualClock::new(now + Duration::minutes(20));

        let err = store.commit_booking(&commit_for(&lock, &trip, now), &later).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(store.get_trip(trip.id).await.unwrap().unwrap().available_seats.len(), 4);
        assert!(store.get_booking_by_lock(lock.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_reads_time_after_a_competing_acquire() {
        let (store, trip, now) = seeded().await;
        let clock = ManualClock::new(now);
        let first = store.acquire(&hold(&trip, &["1A"], now), now).await.unwrap();
        // The commit for `first` was prepared while its hold was live.
        let commit = commit_for(&first, &trip, now);

        clock.advance(Duration::minutes(16));
        let later = clock.now();
        let mut rival = hold(&trip, &["1A"], later);
        rival.holder_id = "holder-2".to_string();
        let second = store.acquire(&rival, later).await.unwrap();

        let err = store.commit_booking(&commit, &clock).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        let err = store.confirm_lock(first.id, commit.booking.id, trip.departs_at, &clock).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let live = store.live_locks(trip.id, later).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
        assert_eq!(live[0].status, LockStatus::Held);
        assert!(store.get_trip(trip.id).await.unwrap().unwrap().is_available("1A"));
    }

    #[tokio::test]
    async fn test_mark_paid_applies_once() {
        let (store, trip, now) = seeded().await;
        let lock = store.acquire(&hold(&trip, &["1A"], now), now).await.unwrap();
        let commit = commit_for(&lock, &trip, now);
        store.commit_booking(&commit, &ManualClock::new(now)).await.unwrap();

        assert!(store.mark_paid(commit.payment.id, Some("tx-1"), now, now).await.unwrap());
        assert!(!store.mark_paid(commit.payment.id, Some("tx-1"), now, now).await.unwrap());
        assert!(!store.fail_payment(commit.payment.id, "late failure", now).await.unwrap());

        let booking = store.get_booking(commit.booking.id).await.unwrap().unwrap();
        assert_eq!(booking.payment_status, PaymentStatus::Paid);
        assert_eq!(booking.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_settlement_totals_are_bounded_per_run() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let clock = ManualClock::new(now);
        for _ in 0..2 {
            let trip = Trip::new(Uuid::new_v4(), seats(&["1A", "1B"]), 5_000, "NGN", now + Duration::days(2));
            store.upsert_trip(&trip).await.unwrap();
            for seat in ["1A", "1B"] {
                let lock = store.acquire(&hold(&trip, &[seat], now), now).await.unwrap();
                let commit = commit_for(&lock, &trip, now);
                store.commit_booking(&commit, &clock).await.unwrap();
                store.mark_paid(commit.payment.id, None, now, now).await.unwrap();
            }
        }
        let period = SettlementPeriod::new(now - Duration::days(1), now + Duration::days(1)).unwrap();

        let first = store.unsettled_totals(period.start, period.end, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payment_count, 2);
        assert_eq!(first[0].gross_amount, 20_000);
        assert_eq!(first[0].net_amount, 19_000);

        let created = store
            .create_settlement(&Settlement::pending(period, first[0].clone(), now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.payment_count, 2);
        assert!(store
            .create_settlement(&Settlement::pending(period, first[0].clone(), now))
            .await
            .unwrap()
            .is_none());

        let rest = store.unsettled_totals(period.start, period.end, 1).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].agency_id, first[0].agency_id);
        store
            .create_settlement(&Settlement::pending(period, rest[0].clone(), now))
            .await
            .unwrap();
        assert!(store.unsettled_totals(period.start, period.end, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_is_batch_bounded_and_skips_trip_inventory() {
        let (store, trip, now) = seeded().await;
        for seat in ["1A", "1B", "2A"] {
            store.acquire(&hold(&trip, &[seat], now), now).await.unwrap();
        }
        let later = now + Duration::hours(1);

        assert_eq!(store.release_expired(later, 2).await.unwrap().len(), 2);
        assert_eq!(store.release_expired(later, 2).await.unwrap().len(), 1);
        assert!(store.release_expired(later, 2).await.unwrap().is_empty());
        assert_eq!(store.get_trip(trip.id).await.unwrap().unwrap().available_seats.len(), 4);
    }

    #[tokio::test]
    async fn test_idempotency_insert_is_exclusive() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = IdempotencyRecord::pending("k1", "actor", "POST", "/v1/bookings/confirm", "h".into(), now + Duration::hours(24), now);

        assert!(store.insert_pending(&record).await.unwrap());
        assert!(!store.insert_pending(&record).await.unwrap());
        assert!(!store.remove_stale("k1", "actor", now).await.unwrap());

        store
            .complete("k1", "actor", IdempotencyStatus::Failed, None, Some("boom"), now)
            .await
            .unwrap();
        assert!(store.remove_stale("k1", "actor", now).await.unwrap());
        assert!(store.get_record("k1", "actor").await.unwrap().is_none());
    }
}
