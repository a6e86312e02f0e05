use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    middleware::auth::{issue_token, ROLE_GUEST},
    state::AppState,
};

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
    holder_id: String,
    expires_in: u64,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/auth/guest", post(login_guest))
}

/// Anonymous session: the token's subject is the holder id of every seat
/// lock taken with it.
async fn login_guest(State(state): State<AppState>) -> Result<Json<AuthResponse>, AppError> {
    let holder_id = format!("guest-{}", Uuid::new_v4());
    let token = issue_token(&state.auth.secret, &holder_id, ROLE_GUEST, state.auth.expiration)?;
    Ok(Json(AuthResponse { token, holder_id, expires_in: state.auth.expiration }))
}
