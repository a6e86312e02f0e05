use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use transita_core::audit::AuditSink;
use transita_core::settlement::{Settlement, SettlementPeriod, SettlementStatus};
use transita_core::{Clock, CoreError, CoreResult, Repositories};
use transita_shared::models::events::{AuditEvent, SettlementCalculatedEvent, SettlementStatusChangedEvent};

/// Rolls PAID payments up into per-agency payables and tracks the payout.
#[derive(Clone)]
pub struct SettlementService {
    repos: Repositories,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl SettlementService {
    pub fn new(repos: Repositories, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self { repos, audit, clock }
    }

    /// One settlement per agency and currency for payments paid inside
    /// `period`, at most `limit` of them per call. Pairs already settled
    /// are skipped by the store, so repeated calls work through the rest
    /// and then create nothing new.
    pub async fn calculate(&self, period: SettlementPeriod, limit: i64) -> CoreResult<Vec<Settlement>> {
        let groups = self
            .repos
            .settlements
            .unsettled_totals(period.start, period.end, limit.max(1))
            .await?;

        let mut created = Vec::new();
        for totals in groups {
            let agency_id = totals.agency_id;
            let settlement = Settlement::pending(period, totals, self.clock.now());

            match self.repos.settlements.create_settlement(&settlement).await {
                Ok(Some(stored)) => {
                    info!(
                        settlement_id = %stored.id,
                        agency_id = %agency_id,
                        net = stored.net_amount,
                        "settlement calculated over {} payments",
                        stored.payment_count
                    );
                    self.publish_calculated(&stored).await;
                    created.push(stored);
                }
                Ok(None) => {
                    warn!(agency_id = %agency_id, "agency already settled for {}", period.start.date_naive());
                }
                Err(e) => {
                    warn!(agency_id = %agency_id, "settlement failed: {}", e);
                }
            }
        }
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Settlement> {
        self.repos
            .settlements
            .get_settlement(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("settlement {}", id)))
    }

    pub async fn list(&self, limit: i64) -> CoreResult<Vec<Settlement>> {
        self.repos.settlements.list_settlements(limit.clamp(1, 500)).await
    }

    pub async fn mark_processing(&self, id: Uuid) -> CoreResult<Settlement> {
        self.transition(id, SettlementStatus::Processing, None, None).await
    }

    pub async fn mark_paid(&self, id: Uuid, payout_reference: &str) -> CoreResult<Settlement> {
        let payout_reference = payout_reference.trim();
        if payout_reference.is_empty() {
            return Err(CoreError::ValidationError("payout reference is required".to_string()));
        }
        self.transition(id, SettlementStatus::Paid, Some(payout_reference), None).await
    }

    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> CoreResult<Settlement> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CoreError::ValidationError("failure reason is required".to_string()));
        }
        self.transition(id, SettlementStatus::Failed, None, Some(reason)).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: SettlementStatus,
        payout_reference: Option<&str>,
        failure_reason: Option<&str>,
    ) -> CoreResult<Settlement> {
        let current = self.get(id).await?;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(CoreError::Conflict(format!(
                "settlement is {} and cannot move to {}",
                from.as_str(),
                to.as_str()
            )));
        }

        let updated = self
            .repos
            .settlements
            .transition(id, from, to, payout_reference, failure_reason, self.clock.now())
            .await?
            .ok_or_else(|| CoreError::Conflict("settlement changed concurrently".to_string()))?;

        info!(settlement_id = %id, "settlement {} -> {}", from.as_str(), to.as_str());
        self.audit
            .publish(AuditEvent::SettlementStatusChanged(SettlementStatusChangedEvent {
                settlement_id: id,
                agency_id: updated.agency_id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                timestamp: self.clock.now().timestamp(),
            }))
            .await;
        Ok(updated)
    }

    async fn publish_calculated(&self, settlement: &Settlement) {
        self.audit
            .publish(AuditEvent::SettlementCalculated(SettlementCalculatedEvent {
                settlement_id: settlement.id,
                agency_id: settlement.agency_id,
                period_start: settlement.period_start.timestamp(),
                period_end: settlement.period_end.timestamp(),
                gross_amount: settlement.gross_amount,
                fee_amount: settlement.fee_amount,
                net_amount: settlement.net_amount,
                payment_count: settlement.payment_count,
                timestamp: self.clock.now().timestamp(),
            }))
            .await;
    }
}
