//! Payment gateway capability.
//!
//! Providers are stateless adapters behind [`PaymentGateway`]; which one is
//! used is decided once at startup by the factory in `transita-booking`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use transita_shared::Masked;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
    #[error("gateway transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// True when the provider may have acted on the call even though we got
    /// no answer. Such outcomes must never be treated as a decline.
    pub fn is_ambiguous(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Normalised transaction state as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Successful,
    Failed,
    Pending,
    Refunded,
    NotFound,
}

impl GatewayStatus {
    /// Maps provider vocabulary onto the normalised states. Anything not
    /// recognised is treated as still pending.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "successful" | "success" | "succeeded" | "completed" | "paid" => GatewayStatus::Successful,
            "failed" | "failure" | "declined" | "cancelled" | "canceled" | "abandoned" => GatewayStatus::Failed,
            "refunded" | "reversed" => GatewayStatus::Refunded,
            "not_found" | "notfound" => GatewayStatus::NotFound,
            _ => GatewayStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: Masked<String>,
    pub phone: Option<Masked<String>>,
}

#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    pub customer: Customer,
    pub redirect_url: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentLink {
    pub payment_link: String,
    pub transaction_id: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    pub success: bool,
    pub status: GatewayStatus,
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub status: GatewayStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionStatus {
    pub status: GatewayStatus,
    pub amount: i64,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Create a hosted payment for `reference` and return where to pay.
    async fn initiate(&self, request: &InitiatePayment) -> GatewayResult<PaymentLink>;

    /// Look a charge up by our reference, or by the provider's id when known.
    async fn verify(&self, reference: &str, transaction_id: Option<&str>) -> GatewayResult<Verification>;

    /// Refund a settled charge, fully when `amount` is `None`.
    async fn refund(&self, transaction_id: &str, amount: Option<i64>, reason: Option<&str>) -> GatewayResult<RefundReceipt>;

    async fn get_status(&self, transaction_id: &str) -> GatewayResult<TransactionStatus>;

    /// Must return false on any mismatch, malformed or missing signature.
    fn verify_webhook_signature(&self, raw_body: &[u8], signature: Option<&str>) -> bool;
}

/// Provider-neutral webhook body: `charge.completed` / `charge.failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookCharge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookCharge {
    /// Provider transaction id
    pub id: String,
    pub tx_ref: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect()
        }
        Err(_) => String::new(),
    }
}

/// Constant-time check of a hex signature. Never panics.
pub fn verify_webhook(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return false;
    };
    let Some(expected) = decode_hex(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 || !input.is_ascii() {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}
