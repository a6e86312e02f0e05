use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Processing => "PROCESSING",
            SettlementStatus::Paid => "PAID",
            SettlementStatus::Failed => "FAILED",
        }
    }

    /// PENDING -> PROCESSING -> PAID | FAILED
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        matches!(
            (self, next),
            (SettlementStatus::Pending, SettlementStatus::Processing)
                | (SettlementStatus::Processing, SettlementStatus::Paid)
                | (SettlementStatus::Processing, SettlementStatus::Failed)
        )
    }
}

impl FromStr for SettlementStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SettlementStatus::Pending),
            "PROCESSING" => Ok(SettlementStatus::Processing),
            "PAID" => Ok(SettlementStatus::Paid),
            "FAILED" => Ok(SettlementStatus::Failed),
            other => Err(CoreError::InternalError(format!("unknown settlement status {}", other))),
        }
    }
}

/// Half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SettlementPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CoreResult<Self> {
        if end <= start {
            return Err(CoreError::ValidationError("settlement period must end after it starts".to_string()));
        }
        Ok(Self { start, end })
    }

    /// The calendar month before the one containing `now`.
    pub fn previous_month(now: DateTime<Utc>) -> Self {
        let (year, month) = if now.month() == 1 { (now.year() - 1, 12) } else { (now.year(), now.month() - 1) };
        Self {
            start: month_start(year, month),
            end: month_start(now.year(), now.month()),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sums over one agency's unsettled PAID payments in a period, aggregated
/// by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTotals {
    pub agency_id: Uuid,
    pub currency: String,
    pub gross_amount: i64,
    pub fee_amount: i64,
    pub net_amount: i64,
    pub payment_count: i64,
}

impl Settlement {
    /// A PENDING settlement for `totals` over `period`.
    pub fn pending(period: SettlementPeriod, totals: SettlementTotals, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agency_id: totals.agency_id,
            period_start: period.start,
            period_end: period.end,
            currency: totals.currency,
            gross_amount: totals.gross_amount,
            fee_amount: totals.fee_amount,
            net_amount: totals.net_amount,
            payment_count: totals.payment_count,
            status: SettlementStatus::Pending,
            payout_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An agency's payable rollup for one period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settlement {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub gross_amount: i64,
    pub fee_amount: i64,
    pub net_amount: i64,
    pub payment_count: i64,
    pub status: SettlementStatus,
    pub payout_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_month_wraps_year() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let period = SettlementPeriod::previous_month(now);
        assert_eq!(period.start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(period.contains(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap()));
        assert!(!period.contains(period.end));
    }

    #[test]
    fn test_status_transitions() {
        assert!(SettlementStatus::Pending.can_transition_to(SettlementStatus::Processing));
        assert!(SettlementStatus::Processing.can_transition_to(SettlementStatus::Failed));
        assert!(!SettlementStatus::Pending.can_transition_to(SettlementStatus::Paid));
        assert!(!SettlementStatus::Paid.can_transition_to(SettlementStatus::Processing));
    }
}
