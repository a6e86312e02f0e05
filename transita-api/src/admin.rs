use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use transita_booking::{Job, JobReport};
use transita_core::settlement::Settlement;
use transita_core::trip::Trip;
use transita_core::CoreError;

use crate::{error::AppError, middleware::AdminActor, state::AppState, worker};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettlementUpdate {
    #[serde(default)]
    pub payout_reference: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/jobs/{job}/run", post(run_job))
        .route("/v1/admin/settlements", get(list_settlements))
        .route("/v1/admin/settlements/{settlement_id}/{action}", post(update_settlement))
        .route("/v1/admin/trips", post(upsert_trip))
}

/// POST /v1/admin/jobs/{job}/run
async fn run_job(
    State(state): State<AppState>,
    AdminActor(claims): AdminActor,
    Path(job): Path<String>,
) -> Result<Json<JobReport>, AppError> {
    let job: Job = job.parse()?;
    tracing::info!(admin = %claims.sub, job = job.as_str(), "manual job run");
    let report = worker::run_job(&state.engine, &state.metrics, job).await?;
    Ok(Json(report))
}

/// GET /v1/admin/settlements
async fn list_settlements(
    State(state): State<AppState>,
    _admin: AdminActor,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Settlement>>, AppError> {
    let settlements = state.engine.settlements.list(query.limit.unwrap_or(50)).await?;
    Ok(Json(settlements))
}

/// POST /v1/admin/settlements/{settlement_id}/{processing|paid|failed}
async fn update_settlement(
    State(state): State<AppState>,
    _admin: AdminActor,
    Path((settlement_id, action)): Path<(Uuid, String)>,
    Json(update): Json<SettlementUpdate>,
) -> Result<Json<Settlement>, AppError> {
    let service = &state.engine.settlements;
    let settlement = match action.as_str() {
        "processing" => service.mark_processing(settlement_id).await?,
        "paid" => {
            service
                .mark_paid(settlement_id, update.payout_reference.as_deref().unwrap_or_default())
                .await?
        }
        "failed" => service.mark_failed(settlement_id, update.reason.as_deref().unwrap_or_default()).await?,
        other => return Err(CoreError::NotFound(format!("settlement action {}", other)).into()),
    };
    Ok(Json(settlement))
}

/// POST /v1/admin/trips
///
/// Catalog sync: inserts or replaces a trip's seat inventory.
async fn upsert_trip(
    State(state): State<AppState>,
    _admin: AdminActor,
    Json(trip): Json<Trip>,
) -> Result<Json<Trip>, AppError> {
    if trip.seat_numbers.is_empty() || trip.available_seats.iter().any(|s| !trip.has_seat(s)) {
        return Err(CoreError::ValidationError("available seats must be a subset of the trip's seats".to_string()).into());
    }
    state.engine.repos.trips.upsert_trip(&trip).await?;
    Ok(Json(trip))
}
