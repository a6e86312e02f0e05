//! Postgres repository tests against a live database.
//!
//! Ignored by default since they need a reachable Postgres. Point
//! `DATABASE_URL` at a scratch database and run:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/transita_test cargo test -p transita-store --test pg_repositories -- --ignored
//! ```
//!
//! Every test works on its own freshly created trip, so runs can share a
//! database.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use transita_core::booking::{Booking, BookingStatus, ContactInfo, Passenger};
use transita_core::clock::{Clock, ManualClock};
use transita_core::lock::{LockStatus, NewLock, SeatLock};
use transita_core::payment::{Payment, PaymentStatus};
use transita_core::repository::BookingCommit;
use transita_core::trip::Trip;
use transita_core::{CoreError, Repositories};
use transita_shared::Masked;
use transita_store::DbClient;

async fn repositories() -> Repositories {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for the Postgres tests");
    let db = DbClient::new(&url, 10).await.expect("connect to Postgres");
    db.migrate().await.expect("run migrations");
    db.repositories()
}

fn seats(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn seeded_trip(repos: &Repositories, now: DateTime<Utc>) -> Trip {
    let trip = Trip::new(Uuid::new_v4(), seats(&["1A", "1B", "2A", "2B"]), 5_000, "NGN", now + Duration::days(2));
    repos.trips.upsert_trip(&trip).await.unwrap();
    trip
}

fn hold(trip: &Trip, holder: &str, list: &[&str], now: DateTime<Utc>) -> NewLock {
    NewLock {
        trip_id: trip.id,
        holder_id: holder.to_string(),
        seat_numbers: seats(list),
        expires_at: now + Duration::minutes(15),
    }
}

fn commit_for(lock: &SeatLock, trip: &Trip, now: DateTime<Utc>) -> BookingCommit {
    let booking_id = Uuid::new_v4();
    let booking = Booking {
        id: booking_id,
        pnr: booking_id.simple().to_string()[..6].to_uppercase(),
        trip_id: trip.id,
        lock_id: lock.id,
        holder_id: lock.holder_id.clone(),
        passengers: lock
            .seat_numbers
            .iter()
            .map(|s| Passenger { full_name: "Ada Obi".to_string(), seat_number: s.clone() })
            .collect(),
        contact: ContactInfo { email: Masked::new("ada@example.com".to_string()), phone: None },
        total_amount: 5_000,
        currency: "NGN".to_string(),
        payment_status: PaymentStatus::Pending,
        status: BookingStatus::Confirmed,
        created_at: now,
        updated_at: now,
    };
    let payment = Payment::pending(booking_id, trip.agency_id, 5_000, 250, "NGN", None, now);
    BookingCommit { booking, payment, retain_lock_until: trip.departs_at }
}

#[tokio::test]
#[ignore]
async fn test_concurrent_acquires_on_one_seat_yield_one_winner() {
    let repos = repositories().await;
    let now = Utc::now();
    let trip = seeded_trip(&repos, now).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let repos = repos.clone();
        let request = hold(&trip, &format!("holder-{}", i), &["1A", "1B"], now);
        handles.push(tokio::spawn(async move { repos.locks.acquire(&request, now).await }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(CoreError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(repos.locks.live_locks(trip.id, now).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_commit_after_competing_acquire_is_rejected() {
    let repos = repositories().await;
    let now = Utc::now();
    let clock = ManualClock::new(now);
    let trip = seeded_trip(&repos, now).await;

    let first = repos.locks.acquire(&hold(&trip, "holder-1", &["2A"], now), now).await.unwrap();
    let commit = commit_for(&first, &trip, now);

    clock.advance(Duration::minutes(16));
    let later = clock.now();
    let second = repos.locks.acquire(&hold(&trip, "holder-2", &["2A"], later), later).await.unwrap();

    let err = repos.bookings.commit_booking(&commit, &clock).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let live = repos.locks.live_locks(trip.id, later).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, second.id);
    assert!(repos.bookings.get_booking_by_lock(first.id).await.unwrap().is_none());
    let stored = repos.trips.get_trip(trip.id).await.unwrap().unwrap();
    assert!(stored.is_available("2A"));
}

#[tokio::test]
#[ignore]
async fn test_concurrent_sweeps_release_each_lock_once() {
    let repos = repositories().await;
    let now = Utc::now();
    let trip = seeded_trip(&repos, now).await;

    let mut ours = HashSet::new();
    for seat in ["1A", "1B", "2A"] {
        // Short holds, so the sweep below leaves other tests' locks alone.
        let mut request = hold(&trip, "holder-1", &[seat], now);
        request.expires_at = now + Duration::seconds(1);
        let lock = repos.locks.acquire(&request, now).await.unwrap();
        ours.insert(lock.id);
    }

    let later = now + Duration::seconds(2);
    let a = {
        let repos = repos.clone();
        tokio::spawn(async move { repos.locks.release_expired(later, 1_000).await })
    };
    let b = {
        let repos = repos.clone();
        tokio::spawn(async move { repos.locks.release_expired(later, 1_000).await })
    };

    let mut released: Vec<Uuid> = Vec::new();
    for handle in [a, b] {
        released.extend(handle.await.unwrap().unwrap().into_iter().map(|l| l.id).filter(|id| ours.contains(id)));
    }
    released.sort();
    let unique: HashSet<Uuid> = released.iter().copied().collect();
    assert_eq!(released.len(), unique.len(), "a lock was released twice");

    for id in &ours {
        let lock = repos.locks.get_lock(*id).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Released);
    }
    // The sweep never touches inventory.
    assert_eq!(repos.trips.get_trip(trip.id).await.unwrap().unwrap().available_seats.len(), 4);
}
