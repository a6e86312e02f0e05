pub mod audit;
pub mod booking;
pub mod clock;
pub mod gateway;
pub mod idempotency;
pub mod lock;
pub mod payment;
pub mod repository;
pub mod settlement;
pub mod trip;

pub use clock::{Clock, ManualClock, SystemClock};
pub use repository::Repositories;

/// Error taxonomy shared by every component of the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Payment failed: {0}")]
    PaymentError(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Stable short name, used in metrics labels and stored failures.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::ValidationError(_) => "validation",
            CoreError::PaymentError(_) => "payment",
            CoreError::RateLimit(_) => "rate_limit",
            CoreError::StorageError(_) => "storage",
            CoreError::ConfigurationError(_) => "configuration",
            CoreError::InternalError(_) => "internal",
        }
    }
}

impl From<gateway::GatewayError> for CoreError {
    fn from(err: gateway::GatewayError) -> Self {
        CoreError::PaymentError(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
