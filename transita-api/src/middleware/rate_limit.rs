use axum::{
    extract::{ConnectInfo, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use transita_core::CoreError;
use transita_store::redis_repo::rate_limit_key;

use crate::{error::AppError, middleware::auth::decode_token, state::AppState};

const WINDOW_SECONDS: i64 = 60;

/// Who the request counts against: the token's subject when it carries a
/// valid one, else the peer address.
fn caller_key(state: &AppState, req: &Request) -> String {
    let subject = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|token| decode_token(&state.auth.secret, token).ok())
        .map(|claims| claims.sub);

    match subject {
        Some(sub) => format!("actor:{}", sub),
        None => {
            let ip = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!("ip:{}", ip)
        }
    }
}

pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(redis) = state.redis.clone() else {
        return next.run(req).await;
    };

    let caller = caller_key(&state, &req);
    let key = rate_limit_key(&caller, chrono::Utc::now().timestamp(), WINDOW_SECONDS);
    match redis.check_rate_limit(&key, state.rate_limit_per_minute, WINDOW_SECONDS).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            tracing::warn!(caller = %caller, "rate limit exceeded");
            AppError::from(CoreError::RateLimit(format!(
                "more than {} requests per minute",
                state.rate_limit_per_minute
            )))
            .into_response()
        }
        Err(e) => {
            // Fail open
            tracing::warn!("rate limiter unavailable: {}", e);
            next.run(req).await
        }
    }
}
