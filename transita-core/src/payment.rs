use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    RefundInitiated,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::RefundInitiated => "REFUND_INITIATED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUND_INITIATED" => Ok(PaymentStatus::RefundInitiated),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(CoreError::InternalError(format!("unknown payment status {}", other))),
        }
    }
}

/// Progress of a refund request, tracked apart from the payment status so
/// a failed refund leaves the payment PAID for manual follow-up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Requested,
    Processed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Requested => "REQUESTED",
            RefundStatus::Processed => "PROCESSED",
            RefundStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for RefundStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(RefundStatus::Requested),
            "PROCESSED" => Ok(RefundStatus::Processed),
            "FAILED" => Ok(RefundStatus::Failed),
            other => Err(CoreError::InternalError(format!("unknown refund status {}", other))),
        }
    }
}

/// One charge against one booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub agency_id: Uuid,
    pub amount: i64,
    pub platform_fee: i64,
    pub agency_amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Our reference as sent to the gateway (`tx_ref`).
    pub reference: String,
    pub transaction_id: Option<String>,
    pub payment_link: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_requested: bool,
    pub refund_reason: Option<String>,
    pub refund_status: Option<RefundStatus>,
    pub refund_id: Option<String>,
    pub refund_error: Option<String>,
    pub settlement_id: Option<Uuid>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn pending(
        booking_id: Uuid,
        agency_id: Uuid,
        amount: i64,
        platform_fee: i64,
        currency: &str,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            booking_id,
            agency_id,
            amount,
            platform_fee,
            agency_amount: amount - platform_fee,
            currency: currency.to_string(),
            status: PaymentStatus::Pending,
            reference: format!("TRN-{}", id.simple()),
            transaction_id,
            payment_link: None,
            failure_reason: None,
            refund_requested: false,
            refund_reason: None,
            refund_status: None,
            refund_id: None,
            refund_error: None,
            settlement_id: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// PAID, refund asked for, and not yet attempted.
    pub fn refund_due(&self) -> bool {
        self.status == PaymentStatus::Paid
            && self.refund_requested
            && self.refund_status == Some(RefundStatus::Requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::RefundInitiated,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("SETTLED".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_pending_payment_splits_amount() {
        let payment = Payment::pending(Uuid::new_v4(), Uuid::new_v4(), 10_000, 500, "NGN", None, Utc::now());
        assert_eq!(payment.agency_amount, 9_500);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.reference.starts_with("TRN-"));
        assert!(!payment.refund_due());
    }
}
