// =============================================================================
// News generator
// =============================================================================
//
// Templated event scheduler. Picks a template, a target (one symbol or the
// whole market), and an impact magnitude inside the template's range. The
// caller applies the shock to the engine, persists the event and publishes it
// on the bus; the generator itself only fabricates events.
// =============================================================================

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::NewsSeverity;

/// Target symbol used for market-wide events.
pub const MARKET_WIDE: &str = "MARKET";

/// A fabricated news event. `price_impact` is a signed percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsEvent {
    pub id: String,
    pub ticker: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: NewsSeverity,
    pub headline: String,
    pub body: String,
    pub price_impact: f64,
    pub fired_at: i64,
}

impl NewsEvent {
    pub fn is_market_wide(&self) -> bool {
        self.ticker == MARKET_WIDE
    }
}

struct Template {
    kind: &'static str,
    severity: NewsSeverity,
    market_wide: bool,
    headline: &'static str,
    body: &'static str,
    /// Signed percentage range the impact is drawn from.
    impact_pct: (f64, f64),
}

const TEMPLATES: &[Template] = &[
    Template {
        kind: "earnings_beat",
        severity: NewsSeverity::Medium,
        market_wide: false,
        headline: "{sym} crushes quarterly estimates",
        body: "{sym} reported earnings well above consensus, with revenue growth accelerating across all segments.",
        impact_pct: (2.0, 7.0),
    },
    Template {
        kind: "earnings_miss",
        severity: NewsSeverity::Medium,
        market_wide: false,
        headline: "{sym} misses on earnings, guides lower",
        body: "{sym} fell short of expectations and cut forward guidance, citing margin pressure.",
        impact_pct: (-8.0, -2.5),
    },
    Template {
        kind: "analyst_upgrade",
        severity: NewsSeverity::Low,
        market_wide: false,
        headline: "{sym} upgraded to overweight",
        body: "A major sell-side desk raised its rating on {sym}, pointing to improving fundamentals.",
        impact_pct: (0.5, 2.5),
    },
    Template {
        kind: "analyst_downgrade",
        severity: NewsSeverity::Low,
        market_wide: false,
        headline: "{sym} cut to underweight",
        body: "Analysts downgraded {sym} on valuation concerns and slowing order flow.",
        impact_pct: (-2.5, -0.5),
    },
    Template {
        kind: "regulatory_probe",
        severity: NewsSeverity::High,
        market_wide: false,
        headline: "Regulators open probe into {sym}",
        body: "{sym} disclosed a formal investigation into its accounting practices. Shares plunged on the filing.",
        impact_pct: (-15.0, -6.0),
    },
    Template {
        kind: "executive_departure",
        severity: NewsSeverity::Medium,
        market_wide: false,
        headline: "{sym} chief executive steps down",
        body: "{sym} announced an unexpected leadership change effective immediately.",
        impact_pct: (-5.0, -1.0),
    },
    Template {
        kind: "buyback",
        severity: NewsSeverity::Low,
        market_wide: false,
        headline: "{sym} announces expanded buyback",
        body: "The board of {sym} authorised a significant increase to its share repurchase programme.",
        impact_pct: (0.5, 3.0),
    },
    Template {
        kind: "rate_decision",
        severity: NewsSeverity::High,
        market_wide: true,
        headline: "Central bank surprises with rate decision",
        body: "Policy makers moved against consensus, repricing risk assets across the board.",
        impact_pct: (-4.0, 4.0),
    },
    Template {
        kind: "inflation_print",
        severity: NewsSeverity::Medium,
        market_wide: true,
        headline: "Inflation print lands off consensus",
        body: "The monthly inflation reading came in away from forecasts, moving rate expectations.",
        impact_pct: (-2.0, 2.0),
    },
    Template {
        kind: "geopolitical",
        severity: NewsSeverity::High,
        market_wide: true,
        headline: "Geopolitical flashpoint rattles markets",
        body: "Escalating tensions triggered a broad risk-off move and a flight to havens.",
        impact_pct: (-5.0, -1.5),
    },
    Template {
        kind: "sector_rotation",
        severity: NewsSeverity::Low,
        market_wide: true,
        headline: "Funds rotate as quarter end approaches",
        body: "Rebalancing flows nudged the broad market with little change in fundamentals.",
        impact_pct: (-0.8, 0.8),
    },
];

/// Stateful generator; owns its RNG so event sequences are reproducible when
/// seeded.
pub struct NewsGenerator {
    rng: ChaCha8Rng,
}

impl NewsGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng }
    }

    /// Seconds until the next event, uniform in the configured window.
    pub fn next_delay_secs(&mut self, min_secs: u64, max_secs: u64) -> u64 {
        let hi = max_secs.max(min_secs + 1);
        self.rng.gen_range(min_secs..hi)
    }

    /// Fabricate one event targeting either a random symbol or the market.
    pub fn generate(&mut self, symbols: &[String]) -> NewsEvent {
        let tpl = &TEMPLATES[self.rng.gen_range(0..TEMPLATES.len())];
        let ticker = if tpl.market_wide || symbols.is_empty() {
            MARKET_WIDE.to_string()
        } else {
            symbols[self.rng.gen_range(0..symbols.len())].clone()
        };

        let (lo, hi) = tpl.impact_pct;
        let impact = self.rng.gen_range(lo..=hi);

        NewsEvent {
            id: Uuid::new_v4().to_string(),
            headline: tpl.headline.replace("{sym}", &ticker),
            body: tpl.body.replace("{sym}", &ticker),
            ticker,
            kind: tpl.kind.to_string(),
            severity: tpl.severity,
            price_impact: impact,
            fired_at: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> Vec<String> {
        vec!["MERX".into(), "GLDR".into()]
    }

    #[test]
    fn generates_plausible_events() {
        let mut gen = NewsGenerator::new(Some(42));
        for _ in 0..50 {
            let ev = gen.generate(&symbols());
            assert!(!ev.headline.contains("{sym}"));
            assert!(!ev.body.contains("{sym}"));
            assert!(ev.price_impact.abs() <= 15.0);
            if !ev.is_market_wide() {
                assert!(symbols().contains(&ev.ticker));
            }
        }
    }

    #[test]
    fn delay_respects_window() {
        let mut gen = NewsGenerator::new(Some(1));
        for _ in 0..100 {
            let d = gen.next_delay_secs(45, 180);
            assert!((45..180).contains(&d));
        }
    }

    #[test]
    fn seeded_sequences_are_reproducible() {
        let mut a = NewsGenerator::new(Some(9));
        let mut b = NewsGenerator::new(Some(9));
        let ea = a.generate(&symbols());
        let eb = b.generate(&symbols());
        assert_eq!(ea.kind, eb.kind);
        assert_eq!(ea.ticker, eb.ticker);
        assert_eq!(ea.price_impact, eb.price_impact);
    }
}
