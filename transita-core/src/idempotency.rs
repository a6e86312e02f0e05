use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Success,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "PENDING",
            IdempotencyStatus::Success => "SUCCESS",
            IdempotencyStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(IdempotencyStatus::Pending),
            "SUCCESS" => Ok(IdempotencyStatus::Success),
            "FAILED" => Ok(IdempotencyStatus::Failed),
            other => Err(CoreError::InternalError(format!("unknown idempotency status {}", other))),
        }
    }
}

/// One deduplicated mutation, unique per `(key, actor_id)`.
///
/// `expires_at` is fixed at creation and never extended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub actor_id: String,
    pub method: String,
    pub endpoint: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response_data: Option<Value>,
    pub error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        key: &str,
        actor_id: &str,
        method: &str,
        endpoint: &str,
        request_hash: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_string(),
            actor_id: actor_id.to_string(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            request_hash,
            status: IdempotencyStatus::Pending,
            response_data: None,
            error: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// SHA-256 over method, endpoint and the payload's canonical JSON.
///
/// `serde_json` maps are ordered, so key order in the client's body does
/// not change the hash.
pub fn request_hash(method: &str, endpoint: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order_but_not_content() {
        let a = request_hash("post", "/v1/bookings/confirm", &json!({"lock_id": "l1", "seats": ["1"]}));
        let b = request_hash("POST", "/v1/bookings/confirm", &json!({"seats": ["1"], "lock_id": "l1"}));
        let c = request_hash("POST", "/v1/bookings/confirm", &json!({"seats": ["2"], "lock_id": "l1"}));
        let d = request_hash("POST", "/v1/payments/refund", &json!({"seats": ["1"], "lock_id": "l1"}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
