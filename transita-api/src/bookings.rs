use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use transita_booking::{BookingResult, ConfirmRequest};
use transita_core::payment::Payment;

use crate::{error::AppError, middleware::Actor, state::AppState};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings/confirm", post(confirm))
        .route("/v1/bookings/{booking_id}", get(get_booking))
        .route("/v1/bookings/{booking_id}/cancel", post(cancel))
        .route("/v1/payments/{payment_id}/refund", post(request_refund))
}

/// POST /v1/bookings/confirm
///
/// Requires an `Idempotency-Key` header. Retrying with the same key and
/// body returns the original booking; a different body is rejected.
async fn confirm(
    State(state): State<AppState>,
    actor: Actor,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<BookingResult>, AppError> {
    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest(format!("{} header is required", IDEMPOTENCY_HEADER)))?;

    let result = state.engine.bookings.confirm_idempotent(&actor.caller(), key, req).await?;
    Ok(Json(result))
}

/// GET /v1/bookings/{booking_id}
async fn get_booking(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingResult>, AppError> {
    Ok(Json(state.engine.bookings.get(&actor.caller(), booking_id).await?))
}

/// POST /v1/bookings/{booking_id}/cancel
async fn cancel(
    State(state): State<AppState>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingResult>, AppError> {
    Ok(Json(state.engine.bookings.cancel(&actor.caller(), booking_id).await?))
}

/// POST /v1/payments/{payment_id}/refund
async fn request_refund(
    State(state): State<AppState>,
    actor: Actor,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<Payment>, AppError> {
    let payment = state
        .engine
        .bookings
        .request_refund(&actor.caller(), payment_id, &req.reason)
        .await?;
    Ok(Json(payment))
}
