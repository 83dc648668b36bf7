use crate::round::types::{RoundPhase, RoundRecord};
use serde::Serialize;

pub const BPS_DENOMINATOR: u64 = 10_000;
pub const PLATFORM_FEE_BPS: u64 = 500;
pub const EARLY_BIRD_MAX_BPS: u64 = 2_000;
pub const DEFAULT_BETTING_WINDOW_MS: i64 = 25_000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OddsSource {
    Estimate,
    Frozen,
}

/// Payout multiplier in basis points (10_000 = 1x).
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OddsEstimate {
    pub multiplier_bps: u64,
    pub source: OddsSource,
}

impl OddsEstimate {
    pub fn frozen(multiplier_bps: u32) -> Self {
        Self {
            multiplier_bps: u64::from(multiplier_bps),
            source: OddsSource::Frozen,
        }
    }
}

/// Bonus for betting early, decaying linearly to zero at the lock deadline.
pub fn early_bird_multiplier_bps(lock_ms: i64, now_ms: i64, betting_window_ms: i64) -> u64 {
    if betting_window_ms <= 0 {
        return BPS_DENOMINATOR;
    }
    let remaining_ms = lock_ms.saturating_sub(now_ms).clamp(0, betting_window_ms) as u128;
    let bonus_bps = u128::from(EARLY_BIRD_MAX_BPS) * remaining_ms / betting_window_ms as u128;
    BPS_DENOMINATOR.saturating_add(bonus_bps as u64)
}

/// Display-only payout estimate for staking `amount` on `side` right now.
///
/// The stake is counted into its own pool. `None` when the round is not taking
/// bets or the pools are empty.
pub fn estimate_payout_multiplier(
    record: &RoundRecord,
    side: &str,
    amount: u64,
    now_ms: i64,
) -> Option<OddsEstimate> {
    if record.phase != RoundPhase::Betting {
        return None;
    }

    let side_pool = record.pools.get(side).copied().unwrap_or_default();
    let winning_pool = u128::from(side_pool.saturating_add(amount));
    if winning_pool == 0 {
        return None;
    }

    let total_pool = u128::from(record.total_pool().saturating_add(amount));
    let pool_after_fee =
        total_pool * u128::from(BPS_DENOMINATOR - PLATFORM_FEE_BPS) / u128::from(BPS_DENOMINATOR);
    let base_bps = pool_after_fee * u128::from(BPS_DENOMINATOR) / winning_pool;

    let bonus_bps = record
        .deadline_for(RoundPhase::Betting)
        .map(|lock_ms| early_bird_multiplier_bps(lock_ms, now_ms, DEFAULT_BETTING_WINDOW_MS))
        .unwrap_or(BPS_DENOMINATOR);
    let multiplier_bps = base_bps * u128::from(bonus_bps) / u128::from(BPS_DENOMINATOR);

    Some(OddsEstimate {
        multiplier_bps: u64::try_from(multiplier_bps).unwrap_or(u64::MAX),
        source: OddsSource::Estimate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::types::GameMode;

    fn betting_round(up: u64, down: u64, lock_ms: i64) -> RoundRecord {
        let mut record = RoundRecord::new("1".into(), GameMode::Prediction, RoundPhase::Betting);
        record.pools.insert("up".to_string(), up);
        record.pools.insert("down".to_string(), down);
        record.deadlines.insert(RoundPhase::Betting, lock_ms);
        record
    }

    #[test]
    fn early_bird_bonus_decays_to_zero_at_lock() {
        assert_eq!(early_bird_multiplier_bps(25_000, 0, 25_000), 12_000);
        assert_eq!(early_bird_multiplier_bps(25_000, 12_500, 25_000), 11_000);
        assert_eq!(early_bird_multiplier_bps(25_000, 25_000, 25_000), 10_000);
        assert_eq!(early_bird_multiplier_bps(25_000, 30_000, 25_000), 10_000);
    }

    #[test]
    fn estimate_applies_fee_to_pool_ratio() {
        // 100 + 100 after 5% fee is 190 split over the 100 winning side
        let record = betting_round(50, 100, 10_000);
        let odds = estimate_payout_multiplier(&record, "up", 50, 10_000).expect("odds");
        assert_eq!(odds.multiplier_bps, 19_000);
        assert_eq!(odds.source, OddsSource::Estimate);
    }

    #[test]
    fn estimate_includes_early_bird_bonus() {
        let record = betting_round(50, 100, 25_000);
        let odds = estimate_payout_multiplier(&record, "up", 50, 0).expect("odds");
        assert_eq!(odds.multiplier_bps, 22_800);
    }

    #[test]
    fn no_estimate_outside_betting_or_for_empty_pools() {
        let mut record = betting_round(0, 0, 10_000);
        assert!(estimate_payout_multiplier(&record, "up", 0, 0).is_none());

        record.phase = RoundPhase::Locked;
        assert!(estimate_payout_multiplier(&record, "up", 10, 0).is_none());
    }

    #[test]
    fn frozen_multiplier_is_marked() {
        let odds = OddsEstimate::frozen(18_500);
        assert_eq!(odds.multiplier_bps, 18_500);
        assert_eq!(odds.source, OddsSource::Frozen);
    }
}
