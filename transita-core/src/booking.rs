use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use transita_shared::Masked;
use uuid::Uuid;

use crate::payment::PaymentStatus;
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Refunded,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "REFUNDED" => Ok(BookingStatus::Refunded),
            other => Err(CoreError::InternalError(format!("unknown booking status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passenger {
    pub full_name: String,
    pub seat_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactInfo {
    pub email: Masked<String>,
    #[serde(default)]
    pub phone: Option<Masked<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub pnr: String,
    pub trip_id: Uuid,
    pub lock_id: Uuid,
    pub holder_id: String,
    pub passengers: Vec<Passenger>,
    pub contact: ContactInfo,
    pub total_amount: i64,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn seat_numbers(&self) -> Vec<String> {
        self.passengers.iter().map(|p| p.seat_number.clone()).collect()
    }
}

/// Every locked seat gets exactly one named passenger, and nothing else.
pub fn validate_passengers(passengers: &[Passenger], locked_seats: &[String]) -> CoreResult<()> {
    if passengers.is_empty() {
        return Err(CoreError::ValidationError("at least one passenger is required".to_string()));
    }

    let mut seen = HashSet::new();
    for passenger in passengers {
        if passenger.full_name.trim().is_empty() {
            return Err(CoreError::ValidationError("passenger name is required".to_string()));
        }
        if !locked_seats.contains(&passenger.seat_number) {
            return Err(CoreError::ValidationError(format!(
                "seat {} is not part of this reservation",
                passenger.seat_number
            )));
        }
        if !seen.insert(passenger.seat_number.as_str()) {
            return Err(CoreError::ValidationError(format!(
                "seat {} is assigned to more than one passenger",
                passenger.seat_number
            )));
        }
    }

    if seen.len() != locked_seats.len() {
        return Err(CoreError::ValidationError(format!(
            "{} seats are held but {} passengers were given",
            locked_seats.len(),
            seen.len()
        )));
    }
    Ok(())
}

pub fn validate_contact(contact: &ContactInfo) -> CoreResult<()> {
    let email = contact.email.expose();
    let well_formed = email
        .split_once('@')
        .map(|(user, domain)| !user.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    if !well_formed {
        return Err(CoreError::ValidationError("contact email is malformed".to_string()));
    }
    Ok(())
}
