// =============================================================================
// Instrument universe
// =============================================================================
//
// Immutable per-symbol profiles created once at boot. Everything downstream
// (price walk, execution costs, book synthesis, shock weighting) keys off
// these numbers; nothing mutates a profile after startup.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

/// Broad asset bucket, used for display and market-wide shock weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Etf,
    Crypto,
    Commodity,
}

/// Immutable trading profile for one instrument.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentProfile {
    pub symbol: String,
    pub name: String,
    pub asset_class: AssetClass,
    /// Price precision in decimal places.
    pub decimals: u32,
    /// Quoted half-spread baseline in basis points of mid.
    pub base_spread_bps: f64,
    /// Scales the square-root-law market impact term.
    pub impact_coeff: f64,
    /// Average daily dollar volume.
    pub adv_usd: f64,
    pub commission_bps: f64,
    pub commission_min: f64,
    /// Annualised short borrow rate.
    pub borrow_apr: f64,
    pub starting_price: f64,
    /// Per-day return volatility target the walk is calibrated to.
    pub volatility_target: f64,
    /// Sensitivity to market-wide news shocks. Safe havens carry a small or
    /// negative beta and move against the shock.
    pub shock_beta: f64,
}

impl InstrumentProfile {
    /// Smallest representable price increment for this instrument.
    pub fn price_tick(&self) -> f64 {
        10f64.powi(-(self.decimals as i32))
    }
}

/// The fixed universe the simulation trades. Symbols are unique.
pub fn universe() -> Vec<InstrumentProfile> {
    vec![
        InstrumentProfile {
            symbol: "MERX".into(),
            name: "Meridian Exchange Group".into(),
            asset_class: AssetClass::Equity,
            decimals: 2,
            base_spread_bps: 3.0,
            impact_coeff: 18.0,
            adv_usd: 850_000_000.0,
            commission_bps: 1.0,
            commission_min: 1.0,
            borrow_apr: 0.015,
            starting_price: 184.50,
            volatility_target: 0.018,
            shock_beta: 1.0,
        },
        InstrumentProfile {
            symbol: "NVAX".into(),
            name: "Novara Axiom Labs".into(),
            asset_class: AssetClass::Equity,
            decimals: 2,
            base_spread_bps: 9.0,
            impact_coeff: 42.0,
            adv_usd: 120_000_000.0,
            commission_bps: 1.0,
            commission_min: 1.0,
            borrow_apr: 0.065,
            starting_price: 23.75,
            volatility_target: 0.045,
            shock_beta: 1.6,
        },
        InstrumentProfile {
            symbol: "CRON".into(),
            name: "Cronos Heavy Industries".into(),
            asset_class: AssetClass::Equity,
            decimals: 2,
            base_spread_bps: 5.0,
            impact_coeff: 25.0,
            adv_usd: 310_000_000.0,
            commission_bps: 1.0,
            commission_min: 1.0,
            borrow_apr: 0.02,
            starting_price: 96.10,
            volatility_target: 0.022,
            shock_beta: 1.2,
        },
        InstrumentProfile {
            symbol: "SPXM".into(),
            name: "Spectrum 500 Index ETF".into(),
            asset_class: AssetClass::Etf,
            decimals: 2,
            base_spread_bps: 1.5,
            impact_coeff: 8.0,
            adv_usd: 4_200_000_000.0,
            commission_bps: 0.5,
            commission_min: 0.5,
            borrow_apr: 0.008,
            starting_price: 512.00,
            volatility_target: 0.011,
            shock_beta: 0.9,
        },
        InstrumentProfile {
            symbol: "GLDR".into(),
            name: "Golden Reserve Trust".into(),
            asset_class: AssetClass::Commodity,
            decimals: 2,
            base_spread_bps: 2.5,
            impact_coeff: 12.0,
            adv_usd: 900_000_000.0,
            commission_bps: 0.8,
            commission_min: 0.8,
            borrow_apr: 0.012,
            starting_price: 221.40,
            volatility_target: 0.009,
            // Safe haven: market-wide shocks push it the other way.
            shock_beta: -0.35,
        },
        InstrumentProfile {
            symbol: "BTCX".into(),
            name: "Bitcoin Exposure Note".into(),
            asset_class: AssetClass::Crypto,
            decimals: 2,
            base_spread_bps: 6.0,
            impact_coeff: 30.0,
            adv_usd: 1_500_000_000.0,
            commission_bps: 2.0,
            commission_min: 1.0,
            borrow_apr: 0.05,
            starting_price: 67_250.00,
            volatility_target: 0.038,
            shock_beta: 1.4,
        },
        InstrumentProfile {
            symbol: "TBND".into(),
            name: "Treasury Ladder ETF".into(),
            asset_class: AssetClass::Etf,
            decimals: 2,
            base_spread_bps: 1.2,
            impact_coeff: 6.0,
            adv_usd: 2_800_000_000.0,
            commission_bps: 0.5,
            commission_min: 0.5,
            borrow_apr: 0.006,
            starting_price: 98.65,
            volatility_target: 0.004,
            shock_beta: -0.2,
        },
        InstrumentProfile {
            symbol: "VLTR".into(),
            name: "Voltaire Grid Storage".into(),
            asset_class: AssetClass::Equity,
            decimals: 2,
            base_spread_bps: 12.0,
            impact_coeff: 55.0,
            adv_usd: 45_000_000.0,
            commission_bps: 1.2,
            commission_min: 1.0,
            borrow_apr: 0.09,
            starting_price: 8.42,
            volatility_target: 0.055,
            shock_beta: 1.8,
        },
    ]
}

/// Universe indexed by symbol for O(1) lookups.
pub fn universe_map() -> HashMap<String, InstrumentProfile> {
    universe()
        .into_iter()
        .map(|p| (p.symbol.clone(), p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_are_unique() {
        let us = universe();
        let mut seen = std::collections::HashSet::new();
        for p in &us {
            assert!(seen.insert(p.symbol.clone()), "duplicate symbol {}", p.symbol);
        }
    }

    #[test]
    fn profiles_are_plausible() {
        for p in universe() {
            assert!(p.starting_price > 0.0, "{}", p.symbol);
            assert!(p.adv_usd > 0.0);
            assert!(p.base_spread_bps > 0.0);
            assert!(p.volatility_target > 0.0);
            assert!(p.decimals <= 8);
        }
    }

    #[test]
    fn price_tick_matches_decimals() {
        let p = &universe()[0];
        assert!((p.price_tick() - 0.01).abs() < 1e-12);
    }
}
