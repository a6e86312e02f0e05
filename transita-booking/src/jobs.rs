//! Periodic lifecycle procedures. Each run works through a bounded batch;
//! a failing item is logged and counted, and the rest of the batch goes on.

use chrono::Duration;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use transita_core::audit::AuditSink;
use transita_core::gateway::{GatewayStatus, PaymentGateway};
use transita_core::payment::{Payment, PaymentStatus};
use transita_core::settlement::SettlementPeriod;
use transita_core::{Clock, CoreError, CoreResult, Repositories};
use transita_shared::models::events::{AuditEvent, NotificationDueEvent, RefundEvent};

use crate::idempotency::IdempotencyGuard;
use crate::locks::LockManager;
use crate::payments::{outcome_from_status, OutcomeSource, PaymentOutcome, PaymentResolver};
use crate::settlement::SettlementService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    ExpireLocks,
    ReconcilePayments,
    ProcessRefunds,
    CalculateSettlements,
    CleanupIdempotency,
}

impl Job {
    pub fn all() -> [Job; 5] {
        [
            Job::ExpireLocks,
            Job::ReconcilePayments,
            Job::ProcessRefunds,
            Job::CalculateSettlements,
            Job::CleanupIdempotency,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::ExpireLocks => "expire_locks",
            Job::ReconcilePayments => "reconcile_payments",
            Job::ProcessRefunds => "process_refunds",
            Job::CalculateSettlements => "calculate_settlements",
            Job::CleanupIdempotency => "cleanup_idempotency",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Job::all()
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| CoreError::NotFound(format!("job {}", s)))
    }
}

/// Per-item tally of one run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobReport {
    pub job: Job,
    /// Items looked at.
    pub processed: usize,
    /// Items whose state moved.
    pub changed: usize,
    pub failed: usize,
}

impl JobReport {
    fn new(job: Job) -> Self {
        Self { job, processed: 0, changed: 0, failed: 0 }
    }

    /// Items handled without error, whether or not they moved.
    pub fn succeeded(&self) -> usize {
        self.processed - self.failed
    }
}

/// Batch sizes per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub expire_locks: i64,
    pub reconcile_payments: i64,
    pub process_refunds: i64,
    /// Agencies settled per run.
    pub calculate_settlements: i64,
    pub cleanup_idempotency: i64,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            expire_locks: 500,
            reconcile_payments: 100,
            process_refunds: 50,
            calculate_settlements: 200,
            cleanup_idempotency: 1_000,
        }
    }
}

#[derive(Clone)]
pub struct LifecycleJobs {
    repos: Repositories,
    locks: LockManager,
    idempotency: IdempotencyGuard,
    payments: PaymentResolver,
    settlements: SettlementService,
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    payment_grace: Duration,
    limits: JobLimits,
}

impl LifecycleJobs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        locks: LockManager,
        idempotency: IdempotencyGuard,
        payments: PaymentResolver,
        settlements: SettlementService,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        payment_grace: Duration,
        limits: JobLimits,
    ) -> Self {
        Self {
            repos,
            locks,
            idempotency,
            payments,
            settlements,
            gateway,
            audit,
            clock,
            payment_grace,
            limits,
        }
    }

    /// Runs `job` once. Only a failure to select the batch is an error.
    pub async fn run(&self, job: Job) -> CoreResult<JobReport> {
        let report = match job {
            Job::ExpireLocks => self.expire_locks().await?,
            Job::ReconcilePayments => self.reconcile_payments().await?,
            Job::ProcessRefunds => self.process_refunds().await?,
            Job::CalculateSettlements => self.calculate_settlements().await?,
            Job::CleanupIdempotency => self.cleanup_idempotency().await?,
        };
        if report.processed > 0 {
            info!(
                job = job.as_str(),
                processed = report.processed,
                changed = report.changed,
                failed = report.failed,
                "job run finished"
            );
        } else {
            debug!(job = job.as_str(), "job run found nothing to do");
        }
        Ok(report)
    }

    async fn expire_locks(&self) -> CoreResult<JobReport> {
        let released = self.locks.release_expired_locks(self.limits.expire_locks).await?;
        let mut report = JobReport::new(Job::ExpireLocks);
        report.processed = released;
        report.changed = released;
        Ok(report)
    }

    async fn reconcile_payments(&self) -> CoreResult<JobReport> {
        let mut report = JobReport::new(Job::ReconcilePayments);
        let now = self.clock.now();

        let pending = self
            .repos
            .payments
            .pending_older_than(now - self.payment_grace, self.limits.reconcile_payments)
            .await?;
        for payment in pending {
            report.processed += 1;
            match self.reconcile_one(&payment).await {
                Ok(changed) => report.changed += usize::from(changed),
                Err(e) => {
                    report.failed += 1;
                    warn!(payment_id = %payment.id, "reconciliation failed: {}", e);
                }
            }
        }

        let refunding = self
            .repos
            .payments
            .refund_initiated_older_than(now, self.limits.reconcile_payments)
            .await?;
        for payment in refunding {
            report.processed += 1;
            match self.poll_refund(&payment).await {
                Ok(changed) => report.changed += usize::from(changed),
                Err(e) => {
                    report.failed += 1;
                    warn!(payment_id = %payment.id, "refund status poll failed: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// Asks the gateway for the truth about one PENDING payment.
    async fn reconcile_one(&self, payment: &Payment) -> CoreResult<bool> {
        let outcome = match payment.transaction_id.as_deref() {
            Some(tx) => {
                let status = self.gateway.get_status(tx).await?;
                let mut outcome = outcome_from_status(
                    &status.status,
                    Some(tx.to_string()),
                    None,
                    status.failure_reason,
                    false,
                );
                if status.status == GatewayStatus::Successful && status.amount < payment.amount {
                    warn!(payment_id = %payment.id, "gateway amount {} is short of {}", status.amount, payment.amount);
                    outcome = PaymentOutcome::Unresolved;
                }
                outcome
            }
            None => {
                // Initiation never reported back; the reference is all we have.
                let verification = self.gateway.verify(&payment.reference, None).await?;
                let mut outcome = outcome_from_status(
                    &verification.status,
                    verification.transaction_id,
                    verification.paid_at,
                    None,
                    true,
                );
                if verification.success && verification.amount < payment.amount {
                    warn!(payment_id = %payment.id, "gateway amount {} is short of {}", verification.amount, payment.amount);
                    outcome = PaymentOutcome::Unresolved;
                }
                outcome
            }
        };

        if outcome == PaymentOutcome::Unresolved {
            debug!(payment_id = %payment.id, "payment still unresolved at gateway");
        }
        self.payments.apply(payment, outcome, OutcomeSource::Reconciliation).await
    }

    async fn poll_refund(&self, payment: &Payment) -> CoreResult<bool> {
        let Some(tx) = payment.transaction_id.as_deref() else {
            return Ok(false);
        };
        let status = self.gateway.get_status(tx).await?;
        if status.status != GatewayStatus::Refunded {
            return Ok(false);
        }
        let changed = self
            .payments
            .apply(payment, PaymentOutcome::Refunded, OutcomeSource::Reconciliation)
            .await?;
        if changed {
            self.notify_refund(payment).await?;
        }
        Ok(changed)
    }

    async fn process_refunds(&self) -> CoreResult<JobReport> {
        let mut report = JobReport::new(Job::ProcessRefunds);
        let due = self.repos.payments.refunds_due(self.limits.process_refunds).await?;
        for payment in due {
            report.processed += 1;
            match self.refund_one(&payment).await {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(payment_id = %payment.id, "refund failed: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// One attempt per payment. A failed attempt is parked as FAILED for
    /// follow-up instead of being retried on the next run.
    async fn refund_one(&self, payment: &Payment) -> CoreResult<bool> {
        let now = self.clock.now();
        let attempt = match payment.transaction_id.as_deref() {
            Some(tx) => self
                .gateway
                .refund(tx, None, payment.refund_reason.as_deref())
                .await
                .map_err(CoreError::from),
            None => Err(CoreError::PaymentError("payment has no gateway transaction".to_string())),
        };

        let receipt = match attempt {
            Ok(receipt) => receipt,
            Err(e) => {
                let message = e.to_string();
                if self.repos.payments.fail_refund(payment.id, &message, now).await? {
                    self.publish_refund(payment, None, Some(message), false).await;
                }
                return Err(e);
            }
        };

        let status = if receipt.status == GatewayStatus::Refunded {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::RefundInitiated
        };
        let changed = self
            .repos
            .bookings
            .complete_refund(payment.id, &receipt.refund_id, status, now)
            .await?;
        if changed {
            info!(payment_id = %payment.id, refund_id = %receipt.refund_id, status = status.as_str(), "refund accepted");
            self.publish_refund(payment, Some(receipt.refund_id), None, true).await;
            if status == PaymentStatus::Refunded {
                self.notify_refund(payment).await?;
            }
        }
        Ok(changed)
    }

    async fn notify_refund(&self, payment: &Payment) -> CoreResult<()> {
        if let Some(booking) = self.repos.bookings.get_booking(payment.booking_id).await? {
            self.audit
                .publish(AuditEvent::NotificationDue(NotificationDueEvent {
                    booking_id: booking.id,
                    pnr: booking.pnr,
                    template: "refund_processed".to_string(),
                    timestamp: self.clock.now().timestamp(),
                }))
                .await;
        }
        Ok(())
    }

    async fn publish_refund(&self, payment: &Payment, refund_id: Option<String>, error: Option<String>, ok: bool) {
        let event = RefundEvent {
            payment_id: payment.id,
            booking_id: payment.booking_id,
            refund_id,
            amount: payment.amount,
            error,
            timestamp: self.clock.now().timestamp(),
        };
        let event = if ok { AuditEvent::RefundProcessed(event) } else { AuditEvent::RefundFailed(event) };
        self.audit.publish(event).await;
    }

    /// Settles the previous calendar month.
    async fn calculate_settlements(&self) -> CoreResult<JobReport> {
        let period = SettlementPeriod::previous_month(self.clock.now());
        let created = self
            .settlements
            .calculate(period, self.limits.calculate_settlements)
            .await?;
        let mut report = JobReport::new(Job::CalculateSettlements);
        report.processed = created.len();
        report.changed = created.len();
        Ok(report)
    }

    async fn cleanup_idempotency(&self) -> CoreResult<JobReport> {
        let purged = self.idempotency.purge_expired(self.limits.cleanup_idempotency).await? as usize;
        let mut report = JobReport::new(Job::CleanupIdempotency);
        report.processed = purged;
        report.changed = purged;
        Ok(report)
    }
}
