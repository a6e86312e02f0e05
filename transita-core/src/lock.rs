use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::trip::{validate_seat_list, Trip};
use crate::{CoreError, CoreResult};

/// Lifecycle of a seat hold.
///
/// HELD -> CONFIRMED on payment, HELD/CONFIRMED -> RELEASED on cancellation,
/// failure or expiry. RELEASED is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Held,
    Confirmed,
    Released,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Held => "HELD",
            LockStatus::Confirmed => "CONFIRMED",
            LockStatus::Released => "RELEASED",
        }
    }
}

impl FromStr for LockStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(LockStatus::Held),
            "CONFIRMED" => Ok(LockStatus::Confirmed),
            "RELEASED" => Ok(LockStatus::Released),
            other => Err(CoreError::InternalError(format!("unknown lock status {}", other))),
        }
    }
}

/// A time-bounded claim on specific seats of one trip.
///
/// `holder_id` is either an authenticated actor id or an anonymous guest
/// session token; both go through the same model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatLock {
    pub id: Uuid,
    pub trip_id: Uuid,
    pub holder_id: String,
    pub seat_numbers: Vec<String>,
    pub status: LockStatus,
    pub booking_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to place a hold.
#[derive(Debug, Clone)]
pub struct NewLock {
    pub trip_id: Uuid,
    pub holder_id: String,
    pub seat_numbers: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// What a successful hold hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockGrant {
    pub lock_id: Uuid,
    pub trip_id: Uuid,
    pub seat_numbers: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of checking whether a lock may move to CONFIRMED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    Confirm,
    AlreadyConfirmed,
}

impl SeatLock {
    pub fn held(new: &NewLock, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trip_id: new.trip_id,
            holder_id: new.holder_id.clone(),
            seat_numbers: new.seat_numbers.clone(),
            status: LockStatus::Held,
            booking_id: None,
            expires_at: new.expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// HELD or CONFIRMED and not yet past `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status != LockStatus::Released && self.expires_at > now
    }

    pub fn overlapping<'a>(&self, seats: &'a [String]) -> Vec<&'a String> {
        seats.iter().filter(|s| self.seat_numbers.contains(s)).collect()
    }

    pub fn grant(&self) -> LockGrant {
        LockGrant {
            lock_id: self.id,
            trip_id: self.trip_id,
            seat_numbers: self.seat_numbers.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Decides a confirmation against the lock's state at this instant.
    ///
    /// Logical expiry wins over the sweep: a HELD lock past `expires_at` is
    /// rejected even if nobody has released it yet.
    pub fn check_confirm(&self, booking_id: Uuid, now: DateTime<Utc>) -> CoreResult<ConfirmAction> {
        match self.status {
            LockStatus::Released => Err(CoreError::Conflict(format!("lock {} is already released", self.id))),
            LockStatus::Confirmed if self.booking_id == Some(booking_id) => Ok(ConfirmAction::AlreadyConfirmed),
            LockStatus::Confirmed => Err(CoreError::Conflict(format!(
                "lock {} is confirmed for another booking",
                self.id
            ))),
            LockStatus::Held if self.expires_at <= now => {
                Err(CoreError::Conflict(format!("lock {} expired at {}", self.id, self.expires_at)))
            }
            LockStatus::Held => Ok(ConfirmAction::Confirm),
        }
    }

    /// Moves a HELD lock to CONFIRMED. The hold is kept live at least until
    /// `retain_until` (the trip's departure).
    pub fn confirm(&mut self, booking_id: Uuid, retain_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = LockStatus::Confirmed;
        self.booking_id = Some(booking_id);
        self.expires_at = self.expires_at.max(retain_until);
        self.updated_at = now;
    }

    /// Returns false when the lock was already released.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == LockStatus::Released {
            return false;
        }
        self.status = LockStatus::Released;
        self.expires_at = now;
        self.updated_at = now;
        true
    }
}

/// The check half of check-then-create. Stores call it while holding their
/// per-trip critical section (row lock or mutex).
pub fn check_acquirable(trip: &Trip, live_locks: &[SeatLock], seats: &[String], now: DateTime<Utc>) -> CoreResult<()> {
    validate_seat_list(seats)?;

    let unknown = trip.unknown_seats(seats);
    if !unknown.is_empty() {
        return Err(CoreError::ValidationError(format!(
            "seats {:?} do not exist on trip {}",
            unknown, trip.id
        )));
    }

    let sold: Vec<&String> = seats.iter().filter(|s| !trip.is_available(s)).collect();
    if !sold.is_empty() {
        return Err(CoreError::Conflict(format!("seats {:?} are already sold", sold)));
    }

    for lock in live_locks.iter().filter(|l| l.trip_id == trip.id && l.is_live(now)) {
        let contested = lock.overlapping(seats);
        if !contested.is_empty() {
            return Err(CoreError::Conflict(format!("seats {:?} are currently held", contested)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn lock_on(trip: &Trip, list: &[&str], now: DateTime<Utc>, ttl: Duration) -> SeatLock {
        SeatLock::held(
            &NewLock {
                trip_id: trip.id,
                holder_id: "user-a".to_string(),
                seat_numbers: seats(list),
                expires_at: now + ttl,
            },
            now,
        )
    }

    #[test]
    fn test_acquirable_rejects_contested_and_sold_seats() {
        let now = Utc::now();
        let mut trip = Trip::new(Uuid::new_v4(), seats(&["1", "2", "3", "4"]), 1000, "NGN", now + Duration::days(1));
        let held = lock_on(&trip, &["1", "2"], now, Duration::minutes(15));

        let err = check_acquirable(&trip, &[held.clone()], &seats(&["2", "3"]), now).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(check_acquirable(&trip, &[held.clone()], &seats(&["3"]), now).is_ok());

        // Once the hold lapses the seat is claimable again, sweep or not
        let later = now + Duration::minutes(16);
        assert!(check_acquirable(&trip, &[held], &seats(&["2"]), later).is_ok());

        trip.remove_seats(&seats(&["4"])).unwrap();
        let err = check_acquirable(&trip, &[], &seats(&["4"]), now).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let err = check_acquirable(&trip, &[], &seats(&["99"]), now).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn test_confirm_rules() {
        let now = Utc::now();
        let trip = Trip::new(Uuid::new_v4(), seats(&["1"]), 1000, "NGN", now + Duration::days(2));
        let booking_id = Uuid::new_v4();

        let mut lock = lock_on(&trip, &["1"], now, Duration::minutes(15));
        assert_eq!(lock.check_confirm(booking_id, now).unwrap(), ConfirmAction::Confirm);

        // Expired but not yet swept
        let expired = lock.check_confirm(booking_id, now + Duration::minutes(15)).unwrap_err();
        assert!(matches!(expired, CoreError::Conflict(_)));

        lock.confirm(booking_id, trip.departs_at, now);
        assert_eq!(lock.expires_at, trip.departs_at);
        assert_eq!(lock.check_confirm(booking_id, now).unwrap(), ConfirmAction::AlreadyConfirmed);
        assert!(lock.check_confirm(Uuid::new_v4(), now).is_err());

        assert!(lock.release(now));
        assert!(!lock.release(now));
        assert!(lock.check_confirm(booking_id, now).is_err());
    }
}
