use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};

use transita_booking::WebhookOutcome;

use crate::{error::AppError, state::AppState};

pub const SIGNATURE_HEADER: &str = "x-transita-signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
///
/// The body is taken raw: the signature covers the exact bytes sent.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookOutcome>), AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state.engine.payments.handle_webhook(&body, signature).await?;

    match &outcome {
        WebhookOutcome::Rejected => {
            return Err(AppError::Authentication("invalid webhook signature".to_string()));
        }
        WebhookOutcome::Ignored { reason } => tracing::info!("webhook ignored: {}", reason),
        WebhookOutcome::Applied { payment_id, changed } => {
            tracing::info!(payment_id = %payment_id, changed, "webhook applied");
        }
    }
    Ok((StatusCode::OK, Json(outcome)))
}
