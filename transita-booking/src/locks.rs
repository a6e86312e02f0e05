use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use transita_core::audit::AuditSink;
use transita_core::lock::{LockGrant, NewLock, SeatLock};
use transita_core::trip::validate_seat_list;
use transita_core::{Clock, CoreError, CoreResult, Repositories};
use transita_shared::models::events::{AuditEvent, LockReleasedEvent, SeatsHeldEvent};

/// Bookable seats on a trip right now.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Availability {
    pub trip_id: Uuid,
    pub capacity: i32,
    /// Unsold and not covered by a live lock, in catalog order.
    pub available_seats: Vec<String>,
    pub held_seats: Vec<String>,
}

/// Seat holds: acquisition, confirmation, release and the expiry sweep.
#[derive(Clone)]
pub struct LockManager {
    repos: Repositories,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    hold_duration: Duration,
    max_seats_per_lock: usize,
}

impl LockManager {
    pub fn new(
        repos: Repositories,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        hold_duration: Duration,
        max_seats_per_lock: usize,
    ) -> Self {
        Self { repos, audit, clock, hold_duration, max_seats_per_lock }
    }

    pub fn hold_duration(&self) -> Duration {
        self.hold_duration
    }

    /// Holds `seats` for `holder_id`, for `hold_duration` or the configured default.
    pub async fn acquire_lock(
        &self,
        trip_id: Uuid,
        holder_id: &str,
        seats: &[String],
        hold_duration: Option<Duration>,
    ) -> CoreResult<LockGrant> {
        if holder_id.trim().is_empty() {
            return Err(CoreError::ValidationError("holder id is required".to_string()));
        }
        validate_seat_list(seats)?;
        if seats.len() > self.max_seats_per_lock {
            return Err(CoreError::ValidationError(format!(
                "at most {} seats can be held at once",
                self.max_seats_per_lock
            )));
        }
        let hold = hold_duration.unwrap_or(self.hold_duration);
        if hold <= Duration::zero() {
            return Err(CoreError::ValidationError("hold duration must be positive".to_string()));
        }

        let now = self.clock.now();
        let request = NewLock {
            trip_id,
            holder_id: holder_id.to_string(),
            seat_numbers: seats.to_vec(),
            expires_at: now + hold,
        };
        let lock = self.repos.locks.acquire(&request, now).await?;
        info!(lock_id = %lock.id, trip_id = %trip_id, seats = ?lock.seat_numbers, "seats held until {}", lock.expires_at);

        self.audit
            .publish(AuditEvent::SeatsHeld(SeatsHeldEvent {
                lock_id: lock.id,
                trip_id,
                holder_id: lock.holder_id.clone(),
                seat_numbers: lock.seat_numbers.clone(),
                expires_at: lock.expires_at.timestamp(),
                timestamp: now.timestamp(),
            }))
            .await;

        Ok(lock.grant())
    }

    pub async fn get_lock(&self, lock_id: Uuid) -> CoreResult<SeatLock> {
        self.repos
            .locks
            .get_lock(lock_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", lock_id)))
    }

    /// HELD -> CONFIRMED. Re-confirming for the same booking is a no-op.
    pub async fn confirm_lock(
        &self,
        lock_id: Uuid,
        booking_id: Uuid,
        retain_until: DateTime<Utc>,
    ) -> CoreResult<SeatLock> {
        let lock = self
            .repos
            .locks
            .confirm_lock(lock_id, booking_id, retain_until, self.clock.as_ref())
            .await?;
        debug!(lock_id = %lock_id, booking_id = %booking_id, "lock confirmed");
        Ok(lock)
    }

    /// Releases whatever state the lock is in. Returns false if it already was.
    pub async fn release_lock(&self, lock_id: Uuid, reason: &str) -> CoreResult<bool> {
        let now = self.clock.now();
        let (lock, changed) = self.repos.locks.release_lock(lock_id, now).await?;
        if changed {
            info!(lock_id = %lock_id, reason, "lock released");
            self.publish_released(&lock, reason, now).await;
        }
        Ok(changed)
    }

    /// Seats covered by live locks on the trip.
    pub async fn get_locked_seats(&self, trip_id: Uuid) -> CoreResult<BTreeSet<String>> {
        let locks = self.repos.locks.live_locks(trip_id, self.clock.now()).await?;
        Ok(locks.into_iter().flat_map(|l| l.seat_numbers).collect())
    }

    /// True when every seat is unsold and free of live locks.
    pub async fn are_seats_available(&self, trip_id: Uuid, seats: &[String]) -> CoreResult<bool> {
        validate_seat_list(seats)?;
        let trip = self
            .repos
            .trips
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
        let locked = self.get_locked_seats(trip_id).await?;
        Ok(seats.iter().all(|s| trip.is_available(s) && !locked.contains(s)))
    }

    pub async fn availability(&self, trip_id: Uuid) -> CoreResult<Availability> {
        let trip = self
            .repos
            .trips
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
        let locked = self.get_locked_seats(trip_id).await?;
        let held_seats = trip.seat_numbers.iter().filter(|s| locked.contains(*s)).cloned().collect();
        let available_seats = trip
            .available_seats
            .iter()
            .filter(|s| !locked.contains(*s))
            .cloned()
            .collect();
        Ok(Availability {
            trip_id,
            capacity: trip.capacity,
            available_seats,
            held_seats,
        })
    }

    /// Guard run at confirmation time: nothing but `lock` may cover its
    /// seats, and the trip must still have them unsold.
    pub async fn ensure_exclusive(&self, lock: &SeatLock) -> CoreResult<()> {
        let trip = self
            .repos
            .trips
            .get_trip(lock.trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", lock.trip_id)))?;
        let sold: Vec<&String> = lock.seat_numbers.iter().filter(|s| !trip.is_available(s)).collect();
        if !sold.is_empty() {
            return Err(CoreError::Conflict(format!("seats {:?} are already sold", sold)));
        }

        let others = self.repos.locks.live_locks(lock.trip_id, self.clock.now()).await?;
        for other in others.iter().filter(|o| o.id != lock.id) {
            let contested = other.overlapping(&lock.seat_numbers);
            if !contested.is_empty() {
                return Err(CoreError::Conflict(format!("seats {:?} are held by another lock", contested)));
            }
        }
        Ok(())
    }

    /// Sweep: releases up to `limit` locks past their expiry.
    pub async fn release_expired_locks(&self, limit: i64) -> CoreResult<usize> {
        let now = self.clock.now();
        let released = self.repos.locks.release_expired(now, limit).await?;
        for lock in &released {
            self.publish_released(lock, "expired", now).await;
        }
        if !released.is_empty() {
            info!("released {} expired locks", released.len());
        }
        Ok(released.len())
    }

    async fn publish_released(&self, lock: &SeatLock, reason: &str, now: DateTime<Utc>) {
        self.audit
            .publish(AuditEvent::LockReleased(LockReleasedEvent {
                lock_id: lock.id,
                trip_id: lock.trip_id,
                reason: reason.to_string(),
                timestamp: now.timestamp(),
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{seats, TestEngine};
    use transita_core::lock::LockStatus;

    #[tokio::test]
    async fn test_reservation_scenario() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2", "3"]).await;
        let locks = &t.engine.locks;

        let a = locks.acquire_lock(trip.id, "user-a", &seats(&["1", "2"]), None).await.unwrap();
        assert_eq!(a.expires_at, t.clock.now() + Duration::minutes(15));
        assert!(!locks.are_seats_available(trip.id, &seats(&["1", "2"])).await.unwrap());
        assert!(locks.are_seats_available(trip.id, &seats(&["3"])).await.unwrap());

        let err = locks.acquire_lock(trip.id, "user-b", &seats(&["2", "3"]), None).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        locks.acquire_lock(trip.id, "user-b", &seats(&["3"]), Some(Duration::minutes(30))).await.unwrap();

        t.clock.advance(Duration::minutes(16));
        assert_eq!(locks.release_expired_locks(100).await.unwrap(), 1);

        assert!(locks.are_seats_available(trip.id, &seats(&["1", "2"])).await.unwrap());
        assert!(!locks.are_seats_available(trip.id, &seats(&["3"])).await.unwrap());
        assert_eq!(t.engine.repos.locks.get_lock(a.lock_id).await.unwrap().unwrap().status, LockStatus::Released);
        assert_eq!(t.audit.count_topic("holds.released"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overlapping_acquires_yield_one_winner() {
        let t = TestEngine::new().await;
        let trip_id = t.seed_trip(&["1", "2", "3", "4"]).await.id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = t.engine.locks.clone();
            let wanted = if i % 2 == 0 { seats(&["2", "3"]) } else { seats(&["3", "4"]) };
            handles.push(tokio::spawn(async move {
                locks.acquire_lock(trip_id, &format!("holder-{}", i), &wanted, None).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, CoreError::Conflict(_))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_locks_stay_disjoint_under_churn() {
        let t = TestEngine::new().await;
        let trip_id = t.seed_trip(&["1", "2", "3", "4", "5", "6"]).await.id;

        let mut handles = Vec::new();
        for i in 0..30usize {
            let locks = t.engine.locks.clone();
            let a = (i % 6 + 1).to_string();
            let b = ((i + 1) % 6 + 1).to_string();
            handles.push(tokio::spawn(async move {
                let _ = locks.acquire_lock(trip_id, "churn", &[a, b], None).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let live = t.engine.repos.locks.live_locks(trip_id, t.clock.now()).await.unwrap();
        let mut seen = BTreeSet::new();
        for lock in live {
            for seat in lock.seat_numbers {
                assert!(seen.insert(seat), "seat held twice");
            }
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2"]).await;
        let grant = t.engine.locks.acquire_lock(trip.id, "user-a", &seats(&["1"]), None).await.unwrap();

        assert!(t.engine.locks.release_lock(grant.lock_id, "abandoned").await.unwrap());
        assert!(!t.engine.locks.release_lock(grant.lock_id, "abandoned").await.unwrap());
        assert_eq!(t.audit.count_topic("holds.released"), 1);
    }

    #[tokio::test]
    async fn test_acquire_validation() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2"]).await;
        let locks = &t.engine.locks;

        let unknown_trip = locks.acquire_lock(Uuid::new_v4(), "a", &seats(&["1"]), None).await;
        assert!(matches!(unknown_trip, Err(CoreError::NotFound(_))));
        let empty = locks.acquire_lock(trip.id, "a", &[], None).await;
        assert!(matches!(empty, Err(CoreError::ValidationError(_))));
        let dup = locks.acquire_lock(trip.id, "a", &seats(&["1", "1"]), None).await;
        assert!(matches!(dup, Err(CoreError::ValidationError(_))));
        let no_holder = locks.acquire_lock(trip.id, " ", &seats(&["1"]), None).await;
        assert!(matches!(no_holder, Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_availability_subtracts_live_locks() {
        let t = TestEngine::new().await;
        let trip = t.seed_trip(&["1", "2", "3"]).await;
        t.engine.locks.acquire_lock(trip.id, "a", &seats(&["2"]), None).await.unwrap();

        let availability = t.engine.locks.availability(trip.id).await.unwrap();
        assert_eq!(availability.available_seats, seats(&["1", "3"]));
        assert_eq!(availability.held_seats, seats(&["2"]));
    }
}
