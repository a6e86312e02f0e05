use serde::{Deserialize, Serialize};
use transita_core::{CoreError, CoreResult};

const BPS_DENOMINATOR: i64 = 10_000;

/// How one booking's amount divides between the platform and the agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub amount: i64,
    pub platform_fee: i64,
    pub agency_amount: i64,
}

/// `fare × seats`, with the platform fee taken in basis points and rounded
/// down so the agency never receives less than its exact share.
pub fn split_fare(fare_amount: i64, seats: usize, platform_fee_bps: u32) -> CoreResult<FeeSplit> {
    if fare_amount <= 0 {
        return Err(CoreError::ValidationError(format!("fare must be positive, got {}", fare_amount)));
    }
    if seats == 0 {
        return Err(CoreError::ValidationError("a booking needs at least one seat".to_string()));
    }
    if i64::from(platform_fee_bps) > BPS_DENOMINATOR {
        return Err(CoreError::ConfigurationError(format!(
            "platform fee of {} bps exceeds 100%",
            platform_fee_bps
        )));
    }

    let amount = i64::try_from(seats)
        .ok()
        .and_then(|n| fare_amount.checked_mul(n))
        .ok_or_else(|| CoreError::ValidationError("booking amount overflows".to_string()))?;
    let platform_fee = amount
        .checked_mul(i64::from(platform_fee_bps))
        .map(|v| v / BPS_DENOMINATOR)
        .ok_or_else(|| CoreError::ValidationError("platform fee overflows".to_string()))?;

    Ok(FeeSplit {
        amount,
        platform_fee,
        agency_amount: amount - platform_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rounds_down_in_agency_favour() {
        let split = split_fare(3_333, 3, 250).unwrap();
        assert_eq!(split.amount, 9_999);
        assert_eq!(split.platform_fee, 249);
        assert_eq!(split.agency_amount, 9_750);
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        assert!(matches!(split_fare(0, 2, 100), Err(CoreError::ValidationError(_))));
        assert!(matches!(split_fare(-50, 2, 100), Err(CoreError::ValidationError(_))));
        assert!(matches!(split_fare(100, 0, 100), Err(CoreError::ValidationError(_))));
        assert!(matches!(split_fare(100, 1, 10_001), Err(CoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_zero_fee() {
        let split = split_fare(5_000, 2, 0).unwrap();
        assert_eq!(split, FeeSplit { amount: 10_000, platform_fee: 0, agency_amount: 10_000 });
    }
}
