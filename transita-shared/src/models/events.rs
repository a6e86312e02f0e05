use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct SeatsHeldEvent {
    pub lock_id: Uuid,
    pub trip_id: Uuid,
    pub holder_id: String,
    pub seat_numbers: Vec<String>,
    pub expires_at: i64,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct LockReleasedEvent {
    pub lock_id: Uuid,
    pub trip_id: Uuid,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct BookingConfirmedEvent {
    pub booking_id: Uuid,
    pub pnr: String,
    pub trip_id: Uuid,
    pub lock_id: Uuid,
    pub seat_numbers: Vec<String>,
    pub total_amount: i64,
    pub currency: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct BookingCancelledEvent {
    pub booking_id: Uuid,
    pub pnr: String,
    pub trip_id: Uuid,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct PaymentSettledEvent {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub transaction_id: Option<String>,
    /// PAID, FAILED or REFUNDED
    pub status: String,
    pub amount: i64,
    /// "verify", "webhook" or "reconciliation"
    pub source: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct RefundEvent {
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub refund_id: Option<String>,
    pub amount: i64,
    pub error: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct SettlementCalculatedEvent {
    pub settlement_id: Uuid,
    pub agency_id: Uuid,
    pub period_start: i64,
    pub period_end: i64,
    pub gross_amount: i64,
    pub fee_amount: i64,
    pub net_amount: i64,
    pub payment_count: i64,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct SettlementStatusChangedEvent {
    pub settlement_id: Uuid,
    pub agency_id: Uuid,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

/// A notice the external dispatcher (email/SMS) owes the passenger.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct NotificationDueEvent {
    pub booking_id: Uuid,
    pub pnr: String,
    /// "booking_confirmed", "booking_cancelled", "refund_processed"
    pub template: String,
    pub timestamp: i64,
}

/// Everything the engine reports to the audit log sink.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SeatsHeld(SeatsHeldEvent),
    LockReleased(LockReleasedEvent),
    BookingConfirmed(BookingConfirmedEvent),
    BookingCancelled(BookingCancelledEvent),
    PaymentSettled(PaymentSettledEvent),
    RefundProcessed(RefundEvent),
    RefundFailed(RefundEvent),
    SettlementCalculated(SettlementCalculatedEvent),
    SettlementStatusChanged(SettlementStatusChangedEvent),
    NotificationDue(NotificationDueEvent),
}

impl AuditEvent {
    /// Topic the event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            AuditEvent::SeatsHeld(_) => "holds.created",
            AuditEvent::LockReleased(_) => "holds.released",
            AuditEvent::BookingConfirmed(_) => "booking.confirmed",
            AuditEvent::BookingCancelled(_) => "booking.cancelled",
            AuditEvent::PaymentSettled(_) => "payment.settled",
            AuditEvent::RefundProcessed(_) => "refund.processed",
            AuditEvent::RefundFailed(_) => "refund.failed",
            AuditEvent::SettlementCalculated(_) => "settlement.calculated",
            AuditEvent::SettlementStatusChanged(_) => "settlement.status",
            AuditEvent::NotificationDue(_) => "notifications.due",
        }
    }

    /// Partition key: events about the same aggregate stay ordered.
    pub fn key(&self) -> String {
        match self {
            AuditEvent::SeatsHeld(e) => e.trip_id.to_string(),
            AuditEvent::LockReleased(e) => e.trip_id.to_string(),
            AuditEvent::BookingConfirmed(e) => e.booking_id.to_string(),
            AuditEvent::BookingCancelled(e) => e.booking_id.to_string(),
            AuditEvent::PaymentSettled(e) => e.payment_id.to_string(),
            AuditEvent::RefundProcessed(e) | AuditEvent::RefundFailed(e) => e.payment_id.to_string(),
            AuditEvent::SettlementCalculated(e) => e.agency_id.to_string(),
            AuditEvent::SettlementStatusChanged(e) => e.settlement_id.to_string(),
            AuditEvent::NotificationDue(e) => e.booking_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged_by_kind() {
        let event = AuditEvent::LockReleased(LockReleasedEvent {
            lock_id: Uuid::nil(),
            trip_id: Uuid::nil(),
            reason: "expired".to_string(),
            timestamp: 0,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lock_released");
        assert_eq!(json["reason"], "expired");
        assert_eq!(event.topic(), "holds.released");
    }
}
