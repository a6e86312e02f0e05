use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use transita_booking::Caller;

use crate::{error::AppError, state::AppState};

pub const ROLE_GUEST: &str = "GUEST";
pub const ROLE_CUSTOMER: &str = "CUSTOMER";
pub const ROLE_ADMIN: &str = "ADMIN";

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Holder id: a user id or a guest session id.
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

pub fn issue_token(secret: &str, sub: &str, role: &str, ttl_seconds: u64) -> Result<String, AppError> {
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        exp: (Utc::now() + Duration::seconds(ttl_seconds as i64)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Core(transita_core::CoreError::InternalError(format!("Token encoding failed: {}", e))))
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, AppError> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
        .map_err(|e| AppError::Authentication(format!("invalid token: {}", e)))
}

// ============================================================================
// Extractors
// ============================================================================

/// Any authenticated caller, guest or signed in.
#[derive(Debug, Clone)]
pub struct Actor(pub Claims);

impl Actor {
    pub fn caller(&self) -> Caller {
        if self.0.is_admin() {
            Caller::admin(self.0.sub.clone())
        } else {
            Caller::user(self.0.sub.clone())
        }
    }
}

impl FromRequestParts<AppState> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Authentication("missing bearer token".to_string()))?;

        let claims = decode_token(&state.auth.secret, bearer.token())?;
        if ![ROLE_GUEST, ROLE_CUSTOMER, ROLE_ADMIN].contains(&claims.role.as_str()) {
            return Err(AppError::Authorization(format!("unknown role {}", claims.role)));
        }
        Ok(Actor(claims))
    }
}

/// A caller holding the ADMIN role.
#[derive(Debug, Clone)]
pub struct AdminActor(pub Claims);

impl FromRequestParts<AppState> for AdminActor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Actor(claims) = Actor::from_request_parts(parts, state).await?;
        if !claims.is_admin() {
            return Err(AppError::Authorization("admin role required".to_string()));
        }
        Ok(AdminActor(claims))
    }
}
