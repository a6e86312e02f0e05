//! Payment state transitions shared by synchronous verification, webhooks
//! and the reconciliation job. Every transition is conditional in the
//! store, so applying the same outcome twice changes nothing the second time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use transita_core::audit::AuditSink;
use transita_core::booking::BookingStatus;
use transita_core::gateway::{GatewayStatus, PaymentGateway, WebhookEvent};
use transita_core::payment::{Payment, PaymentStatus};
use transita_core::{Clock, CoreError, CoreResult, Repositories};
use transita_shared::models::events::{
    AuditEvent, BookingCancelledEvent, NotificationDueEvent, PaymentSettledEvent,
};

use crate::locks::LockManager;

/// Where an outcome came from, recorded on the audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSource {
    Verify,
    Webhook,
    Reconciliation,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Verify => "verify",
            OutcomeSource::Webhook => "webhook",
            OutcomeSource::Reconciliation => "reconciliation",
        }
    }
}

/// What the gateway says happened to a charge.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Paid {
        transaction_id: Option<String>,
        paid_at: Option<DateTime<Utc>>,
    },
    Failed {
        reason: String,
    },
    Refunded,
    /// Nothing conclusive yet; the payment stays as it is.
    Unresolved,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Signature missing or wrong; nothing in the body was looked at.
    Rejected,
    Ignored { reason: String },
    Applied { payment_id: Uuid, changed: bool },
}

#[derive(Clone)]
pub struct PaymentResolver {
    repos: Repositories,
    locks: LockManager,
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl PaymentResolver {
    pub fn new(
        repos: Repositories,
        locks: LockManager,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { repos, locks, gateway, audit, clock }
    }

    /// Applies `outcome` to `payment`. Returns whether anything changed.
    pub async fn apply(&self, payment: &Payment, outcome: PaymentOutcome, source: OutcomeSource) -> CoreResult<bool> {
        let now = self.clock.now();
        match outcome {
            PaymentOutcome::Paid { transaction_id, paid_at } => {
                let changed = self
                    .repos
                    .payments
                    .mark_paid(payment.id, transaction_id.as_deref(), paid_at.unwrap_or(now), now)
                    .await?;
                if changed {
                    info!(payment_id = %payment.id, source = source.as_str(), "payment PAID");
                    self.publish_settled(payment, transaction_id.or_else(|| payment.transaction_id.clone()), PaymentStatus::Paid, source, now)
                        .await;
                    self.after_paid(payment).await?;
                }
                Ok(changed)
            }
            PaymentOutcome::Failed { reason } => {
                let changed = self.repos.bookings.fail_payment(payment.id, &reason, now).await?;
                if changed {
                    info!(payment_id = %payment.id, source = source.as_str(), reason = %reason, "payment FAILED");
                    self.publish_settled(payment, payment.transaction_id.clone(), PaymentStatus::Failed, source, now)
                        .await;
                    self.after_failed(payment, &reason, now).await?;
                }
                Ok(changed)
            }
            PaymentOutcome::Refunded => {
                let changed = self.repos.payments.mark_refunded(payment.id, now).await?;
                if changed {
                    info!(payment_id = %payment.id, source = source.as_str(), "refund completed");
                    self.publish_settled(payment, payment.transaction_id.clone(), PaymentStatus::Refunded, source, now)
                        .await;
                }
                Ok(changed)
            }
            PaymentOutcome::Unresolved => Ok(false),
        }
    }

    /// The booking keeps its seats once paid. A booking cancelled while
    /// its payment was in flight gets the money flagged for refund.
    async fn after_paid(&self, payment: &Payment) -> CoreResult<()> {
        let Some(booking) = self.repos.bookings.get_booking(payment.booking_id).await? else {
            warn!(payment_id = %payment.id, "paid payment has no booking");
            return Ok(());
        };

        match booking.status {
            BookingStatus::Confirmed => {
                let retain_until = match self.repos.trips.get_trip(booking.trip_id).await? {
                    Some(trip) => trip.departs_at,
                    None => self.clock.now(),
                };
                if let Err(e) = self.locks.confirm_lock(booking.lock_id, booking.id, retain_until).await {
                    // The seats are already sold to this booking; the lock is bookkeeping.
                    warn!(booking_id = %booking.id, lock_id = %booking.lock_id, "could not confirm lock after payment: {}", e);
                }
            }
            BookingStatus::Cancelled | BookingStatus::Refunded => {
                let flagged = self
                    .repos
                    .payments
                    .request_refund(payment.id, "payment completed after booking was cancelled", self.clock.now())
                    .await?;
                info!(payment_id = %flagged.id, booking_id = %booking.id, "late payment flagged for refund");
            }
        }
        Ok(())
    }

    async fn after_failed(&self, payment: &Payment, reason: &str, now: DateTime<Utc>) -> CoreResult<()> {
        let Some(booking) = self.repos.bookings.get_booking(payment.booking_id).await? else {
            return Ok(());
        };
        if booking.status == BookingStatus::Cancelled {
            self.audit
                .publish(AuditEvent::BookingCancelled(BookingCancelledEvent {
                    booking_id: booking.id,
                    pnr: booking.pnr.clone(),
                    trip_id: booking.trip_id,
                    reason: format!("payment failed: {}", reason),
                    timestamp: now.timestamp(),
                }))
                .await;
            self.audit
                .publish(AuditEvent::NotificationDue(NotificationDueEvent {
                    booking_id: booking.id,
                    pnr: booking.pnr,
                    template: "booking_cancelled".to_string(),
                    timestamp: now.timestamp(),
                }))
                .await;
        }
        Ok(())
    }

    async fn publish_settled(
        &self,
        payment: &Payment,
        transaction_id: Option<String>,
        status: PaymentStatus,
        source: OutcomeSource,
        now: DateTime<Utc>,
    ) {
        self.audit
            .publish(AuditEvent::PaymentSettled(PaymentSettledEvent {
                payment_id: payment.id,
                booking_id: payment.booking_id,
                transaction_id,
                status: status.as_str().to_string(),
                amount: payment.amount,
                source: source.as_str().to_string(),
                timestamp: now.timestamp(),
            }))
            .await;
    }

    /// Verifies the signature over the raw body before reading anything
    /// from it, then applies `charge.completed` / `charge.failed`.
    pub async fn handle_webhook(&self, raw_body: &[u8], signature: Option<&str>) -> CoreResult<WebhookOutcome> {
        if !self.gateway.verify_webhook_signature(raw_body, signature) {
            warn!("webhook rejected: bad or missing signature");
            return Ok(WebhookOutcome::Rejected);
        }

        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|e| CoreError::ValidationError(format!("malformed webhook payload: {}", e)))?;

        if event.event != "charge.completed" && event.event != "charge.failed" {
            return Ok(WebhookOutcome::Ignored { reason: format!("event {} is not handled", event.event) });
        }

        let charge = &event.data;
        let payment = match self.repos.payments.find_by_transaction(&charge.id).await? {
            Some(p) => Some(p),
            None => self.repos.payments.find_by_reference(&charge.tx_ref).await?,
        };
        let Some(payment) = payment else {
            warn!(tx_ref = %charge.tx_ref, transaction_id = %charge.id, "webhook for unknown payment");
            return Ok(WebhookOutcome::Ignored { reason: "unknown payment".to_string() });
        };

        let outcome = match GatewayStatus::parse(&charge.status) {
            GatewayStatus::Successful if event.event == "charge.completed" => {
                if charge.amount < payment.amount || !charge.currency.eq_ignore_ascii_case(&payment.currency) {
                    // Left PENDING; reconciliation asks the gateway directly.
                    warn!(
                        payment_id = %payment.id,
                        expected = payment.amount,
                        received = charge.amount,
                        "webhook amount does not cover the payment"
                    );
                    PaymentOutcome::Unresolved
                } else {
                    PaymentOutcome::Paid { transaction_id: Some(charge.id.clone()), paid_at: None }
                }
            }
            GatewayStatus::Failed => PaymentOutcome::Failed { reason: format!("gateway reported {}", charge.status) },
            _ => PaymentOutcome::Unresolved,
        };

        let changed = self.apply(&payment, outcome, OutcomeSource::Webhook).await?;
        Ok(WebhookOutcome::Applied { payment_id: payment.id, changed })
    }
}

/// Maps a gateway status onto a payment outcome. `NotFound` only resolves
/// when the caller says the charge should exist by now.
pub fn outcome_from_status(
    status: &GatewayStatus,
    transaction_id: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    not_found_is_failure: bool,
) -> PaymentOutcome {
    match status {
        GatewayStatus::Successful => PaymentOutcome::Paid { transaction_id, paid_at },
        GatewayStatus::Failed => PaymentOutcome::Failed {
            reason: failure_reason.unwrap_or_else(|| "declined at gateway".to_string()),
        },
        GatewayStatus::NotFound if not_found_is_failure => PaymentOutcome::Failed {
            reason: "no charge found at gateway".to_string(),
        },
        GatewayStatus::Refunded => PaymentOutcome::Refunded,
        GatewayStatus::Pending | GatewayStatus::NotFound => PaymentOutcome::Unresolved,
    }
}
