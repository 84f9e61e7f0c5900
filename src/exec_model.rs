// =============================================================================
// Execution-cost model
// =============================================================================
//
// Pre-trade cost estimation for simulated fills. One pure function: given an
// instrument profile, the order, and the market context, produce the slippage,
// fill price, commission and borrow accrual that the matcher books and the
// order API quotes back to the caller.
//
// Impact follows the empirical square-root law: participation raised to 0.6,
// scaled by the instrument's impact coefficient and the regime's liquidity
// multiplier. Deterministic for fixed inputs; no I/O, no clock.
// =============================================================================

use serde::Serialize;

use crate::config::RegimeMultipliers;
use crate::instruments::InstrumentProfile;
use crate::types::Side;

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0 * 1000.0;

/// Full cost breakdown for one prospective fill.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEstimate {
    pub slippage_bps: f64,
    pub fill_price: f64,
    pub slippage_cost: f64,
    pub commission: f64,
    pub borrow_accrual: f64,
    pub total_cost: f64,
    /// 0..100 execution quality grade; higher is cheaper.
    pub quality_score: f64,
}

fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Estimate the cost of filling `qty` at reference price `ref_price`.
///
/// * `vol` is the instrument's current running volatility (per-day fraction).
/// * `opens_short_qty` is the portion of `qty` that opens or extends short
///   exposure; borrow accrues only on that portion.
/// * `elapsed_ms` is the holding horizon the borrow accrual is prorated over.
pub fn estimate(
    profile: &InstrumentProfile,
    side: Side,
    qty: f64,
    ref_price: f64,
    mid: f64,
    vol: f64,
    regime: RegimeMultipliers,
    opens_short_qty: f64,
    elapsed_ms: u64,
) -> ExecutionEstimate {
    let notional = qty * ref_price;

    let vol_mult = clamp(1.0 + 25.0 * vol, 0.85, 4.0);
    let participation = if profile.adv_usd > 0.0 {
        notional / profile.adv_usd
    } else {
        0.0
    };
    let impact_bps = profile.base_spread_bps
        + profile.impact_coeff * participation.powf(0.6) * regime.liquidity * vol_mult;

    let direction = side.direction();
    let fill_price = ref_price * (1.0 + direction * impact_bps / 10_000.0);

    let slippage_cost = (direction * (fill_price - mid) * qty).max(0.0);

    let commission = (notional * profile.commission_bps / 10_000.0).max(profile.commission_min);

    let borrow_accrual = if opens_short_qty > 0.0 {
        opens_short_qty
            * fill_price
            * (profile.borrow_apr * regime.borrow)
            * (elapsed_ms as f64 / MS_PER_YEAR)
    } else {
        0.0
    };

    let total_cost = slippage_cost + commission + borrow_accrual;

    let comm_bps = if notional > 0.0 {
        commission / notional * 10_000.0
    } else {
        0.0
    };
    let borrow_bps = if notional > 0.0 {
        borrow_accrual / notional * 10_000.0
    } else {
        0.0
    };
    let quality_score = clamp(
        100.0 - 0.6 * impact_bps - 0.3 * comm_bps - 0.1 * borrow_bps,
        0.0,
        100.0,
    );

    ExecutionEstimate {
        slippage_bps: impact_bps,
        fill_price,
        slippage_cost,
        commission,
        borrow_accrual,
        total_cost,
        quality_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::universe;

    fn normal() -> RegimeMultipliers {
        RegimeMultipliers {
            liquidity: 1.0,
            vol: 1.0,
            borrow: 1.0,
        }
    }

    fn profile() -> InstrumentProfile {
        universe().into_iter().find(|p| p.symbol == "MERX").unwrap()
    }

    #[test]
    fn cost_is_monotonic_in_quantity() {
        let p = profile();
        let mut prev = 0.0;
        for qty in [10.0, 100.0, 1_000.0, 10_000.0] {
            let est = estimate(&p, Side::Buy, qty, 100.0, 100.0, 0.01, normal(), 0.0, 0);
            assert!(
                est.total_cost >= prev,
                "cost fell from {prev} to {} at qty {qty}",
                est.total_cost
            );
            prev = est.total_cost;
        }
    }

    #[test]
    fn fills_straddle_reference_by_direction() {
        let p = profile();
        let buy = estimate(&p, Side::Buy, 100.0, 100.0, 100.0, 0.01, normal(), 0.0, 0);
        let sell = estimate(&p, Side::Sell, 100.0, 100.0, 100.0, 0.01, normal(), 0.0, 0);
        assert!(buy.fill_price >= 100.0);
        assert!(sell.fill_price <= 100.0);
    }

    #[test]
    fn borrow_accrual_is_linear_in_time() {
        let p = profile();
        let t = 86_400_000; // one day
        let one = estimate(&p, Side::Sell, 100.0, 100.0, 100.0, 0.01, normal(), 100.0, t);
        let two = estimate(&p, Side::Sell, 100.0, 100.0, 100.0, 0.01, normal(), 100.0, 2 * t);
        let larger = one.borrow_accrual.max(two.borrow_accrual);
        assert!(
            (two.borrow_accrual - 2.0 * one.borrow_accrual).abs() <= 0.01 * larger,
            "borrow not linear: {} vs 2x{}",
            two.borrow_accrual,
            one.borrow_accrual
        );
    }

    #[test]
    fn no_borrow_without_short_exposure() {
        let p = profile();
        let est = estimate(&p, Side::Buy, 100.0, 100.0, 100.0, 0.01, normal(), 0.0, 86_400_000);
        assert_eq!(est.borrow_accrual, 0.0);
    }

    #[test]
    fn commission_floor_applies_to_tiny_orders() {
        let p = profile();
        let est = estimate(&p, Side::Buy, 1.0, 10.0, 10.0, 0.0, normal(), 0.0, 0);
        assert_eq!(est.commission, p.commission_min);
    }

    #[test]
    fn vol_multiplier_is_clamped() {
        let p = profile();
        // Absurd volatility should not blow impact past the 4x clamp.
        let calm = estimate(&p, Side::Buy, 100.0, 100.0, 100.0, 0.0, normal(), 0.0, 0);
        let wild = estimate(&p, Side::Buy, 100.0, 100.0, 100.0, 10.0, normal(), 0.0, 0);
        let calm_excess = calm.slippage_bps - p.base_spread_bps;
        let wild_excess = wild.slippage_bps - p.base_spread_bps;
        assert!(wild_excess <= calm_excess / 0.85 * 4.0 + 1e-9);
    }

    #[test]
    fn quality_score_stays_in_range() {
        let p = profile();
        for qty in [1.0, 1e6] {
            let est = estimate(&p, Side::Buy, qty, 100.0, 100.0, 0.5, normal(), qty, 1_000_000);
            assert!((0.0..=100.0).contains(&est.quality_score));
        }
    }

    #[test]
    fn deterministic_for_fixed_inputs() {
        let p = profile();
        let a = estimate(&p, Side::Sell, 250.0, 101.5, 101.4, 0.02, normal(), 250.0, 3_600_000);
        let b = estimate(&p, Side::Sell, 250.0, 101.5, 101.4, 0.02, normal(), 250.0, 3_600_000);
        assert_eq!(a.fill_price, b.fill_price);
        assert_eq!(a.total_cost, b.total_cost);
    }
}
