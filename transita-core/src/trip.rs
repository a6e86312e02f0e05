use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Seat inventory of one trip, as owned by the route/trip catalog.
///
/// `available_seats` only shrinks when a booking is committed and only grows
/// back on cancellation, failed payment or completed refund. Holds never
/// touch it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub capacity: i32,
    pub seat_numbers: Vec<String>,
    pub available_seats: Vec<String>,
    /// Fare per seat, in minor currency units.
    pub fare_amount: i64,
    pub currency: String,
    pub departs_at: DateTime<Utc>,
}

impl Trip {
    pub fn new(
        agency_id: Uuid,
        seat_numbers: Vec<String>,
        fare_amount: i64,
        currency: &str,
        departs_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agency_id,
            capacity: seat_numbers.len() as i32,
            available_seats: seat_numbers.clone(),
            seat_numbers,
            fare_amount,
            currency: currency.to_string(),
            departs_at,
        }
    }

    pub fn has_seat(&self, seat: &str) -> bool {
        self.seat_numbers.iter().any(|s| s == seat)
    }

    pub fn is_available(&self, seat: &str) -> bool {
        self.available_seats.iter().any(|s| s == seat)
    }

    /// Seats from `seats` that are not part of this trip at all.
    pub fn unknown_seats(&self, seats: &[String]) -> Vec<String> {
        seats.iter().filter(|s| !self.has_seat(s)).cloned().collect()
    }

    /// Take sold seats out of the available pool. All-or-nothing.
    pub fn remove_seats(&mut self, seats: &[String]) -> CoreResult<()> {
        let sold: Vec<&String> = seats.iter().filter(|s| !self.is_available(s)).collect();
        if !sold.is_empty() {
            return Err(CoreError::Conflict(format!(
                "seats no longer available on trip {}: {:?}",
                self.id, sold
            )));
        }
        self.available_seats.retain(|s| !seats.contains(s));
        Ok(())
    }

    /// Put seats back into the available pool, ignoring ones already there.
    pub fn restore_seats(&mut self, seats: &[String]) {
        for seat in seats {
            if self.has_seat(seat) && !self.is_available(seat) {
                self.available_seats.push(seat.clone());
            }
        }
        // Keep catalog order so responses stay stable.
        let order = &self.seat_numbers;
        self.available_seats
            .sort_by_key(|s| order.iter().position(|o| o == s).unwrap_or(usize::MAX));
    }
}

/// Rejects empty or duplicated seat lists before any store round-trip.
pub fn validate_seat_list(seats: &[String]) -> CoreResult<()> {
    if seats.is_empty() {
        return Err(CoreError::ValidationError("at least one seat is required".to_string()));
    }
    if seats.iter().any(|s| s.trim().is_empty()) {
        return Err(CoreError::ValidationError("seat numbers must not be blank".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for seat in seats {
        if !seen.insert(seat.as_str()) {
            return Err(CoreError::ValidationError(format!("seat {} requested twice", seat)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_remove_and_restore_seats() {
        let mut trip = Trip::new(Uuid::new_v4(), seats(&["1", "2", "3"]), 5000, "NGN", Utc::now());

        trip.remove_seats(&seats(&["1", "3"])).unwrap();
        assert_eq!(trip.available_seats, seats(&["2"]));

        // Partially sold request fails without removing anything
        let err = trip.remove_seats(&seats(&["1", "2"])).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(trip.available_seats, seats(&["2"]));

        trip.restore_seats(&seats(&["3", "1", "1", "9"]));
        assert_eq!(trip.available_seats, seats(&["1", "2", "3"]));
    }

    #[test]
    fn test_validate_seat_list() {
        assert!(validate_seat_list(&[]).is_err());
        assert!(validate_seat_list(&seats(&["1", "1"])).is_err());
        assert!(validate_seat_list(&seats(&[" "])).is_err());
        assert!(validate_seat_list(&seats(&["1", "2"])).is_ok());
    }
}
