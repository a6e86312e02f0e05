use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use transita_booking::Availability;
use transita_core::CoreError;

use crate::{error::AppError, middleware::Actor, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub trip_id: Uuid,
    pub seat_numbers: Vec<String>,
    /// Overrides the default hold length.
    pub hold_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub lock_id: Uuid,
    pub trip_id: Uuid,
    pub seat_numbers: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    /// Comma-separated seat numbers to check.
    pub seats: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    #[serde(flatten)]
    pub availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<RequestedSeats>,
}

#[derive(Debug, Serialize)]
pub struct RequestedSeats {
    pub seats: Vec<String>,
    pub available: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/reservations", post(reserve))
        .route("/v1/reservations/{lock_id}", delete(release))
        .route("/v1/trips/{trip_id}/availability", get(availability))
}

/// POST /v1/reservations
async fn reserve(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), AppError> {
    let hold = req
        .hold_seconds
        .map(|s| Duration::try_seconds(s).ok_or_else(|| AppError::BadRequest("hold_seconds out of range".to_string())))
        .transpose()?;
    let result = state
        .engine
        .bookings
        .reserve(&actor.caller(), req.trip_id, &req.seat_numbers, hold)
        .await;

    let grant = match result {
        Ok(grant) => grant,
        Err(err) => {
            if matches!(err, CoreError::Conflict(_)) {
                state.metrics.seat_conflicts.inc();
            }
            return Err(err.into());
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(ReserveResponse {
            lock_id: grant.lock_id,
            trip_id: grant.trip_id,
            seat_numbers: grant.seat_numbers,
            expires_at: grant.expires_at,
        }),
    ))
}

/// DELETE /v1/reservations/{lock_id}
async fn release(
    State(state): State<AppState>,
    actor: Actor,
    Path(lock_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.engine.bookings.release_hold(&actor.caller(), lock_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/trips/{trip_id}/availability?seats=1,2
async fn availability(
    State(state): State<AppState>,
    Path(trip_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, AppError> {
    let availability = state.engine.locks.availability(trip_id).await?;

    let requested = match query.seats.as_deref().map(parse_seats) {
        Some(seats) if !seats.is_empty() => {
            let available = state.engine.locks.are_seats_available(trip_id, &seats).await?;
            Some(RequestedSeats { seats, available })
        }
        _ => None,
    };

    Ok(Json(AvailabilityResponse { availability, requested }))
}

fn parse_seats(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seats() {
        assert_eq!(parse_seats("1, 2,,3 "), vec!["1", "2", "3"]);
        assert!(parse_seats(" , ").is_empty());
    }
}
