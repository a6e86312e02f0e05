use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use transita_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("forbidden: {0}")]
    Authorization(String),
    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Core(err) => match err {
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Conflict(_) => StatusCode::CONFLICT,
                CoreError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CoreError::PaymentError(_) => StatusCode::PAYMENT_REQUIRED,
                CoreError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
                CoreError::StorageError(_) | CoreError::ConfigurationError(_) | CoreError::InternalError(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal Server Error: {}", self);
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (CoreError::ValidationError("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (CoreError::PaymentError("x".into()), StatusCode::PAYMENT_REQUIRED),
            (CoreError::RateLimit("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (CoreError::StorageError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
        assert_eq!(AppError::Authentication("no token".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Authorization("admin only".into()).status(), StatusCode::FORBIDDEN);
    }
}
