// =============================================================================
// Market regime state machine
// =============================================================================
//
// Four regimes, each carrying liquidity / volatility / borrow multipliers that
// the walk, the spread model and the cost model all consume:
//
//   Normal         - baseline conditions
//   HighVolatility - widened return distribution, moderately wider spreads
//   TightLiquidity - thin books, expensive borrow
//   EventShock     - forced by high-severity news; decays after a bounded dwell
//
// Transitions roll once per tick against configured per-tick probabilities,
// but only after the state has satisfied its minimum dwell. EventShock is
// never entered by chance; only `force_event_shock` puts the machine there.
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{RegimeConfig, RegimeMultipliers};

/// Named market state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Normal,
    HighVolatility,
    TightLiquidity,
    EventShock,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::HighVolatility => write!(f, "high_volatility"),
            Self::TightLiquidity => write!(f, "tight_liquidity"),
            Self::EventShock => write!(f, "event_shock"),
        }
    }
}

/// Multipliers a config assigns to a regime; usable without a machine
/// instance (the matcher maps tick regime tags through this).
pub fn multipliers_for(cfg: &RegimeConfig, regime: MarketRegime) -> RegimeMultipliers {
    match regime {
        MarketRegime::Normal => cfg.normal,
        MarketRegime::HighVolatility => cfg.high_volatility,
        MarketRegime::TightLiquidity => cfg.tight_liquidity,
        MarketRegime::EventShock => cfg.event_shock,
    }
}

/// Dwell-aware probabilistic state machine over [`MarketRegime`].
pub struct RegimeMachine {
    cfg: RegimeConfig,
    current: MarketRegime,
    ticks_in_state: u64,
    /// Remaining forced dwell when in EventShock.
    shock_ticks_left: u64,
}

impl RegimeMachine {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self {
            cfg,
            current: MarketRegime::Normal,
            ticks_in_state: 0,
            shock_ticks_left: 0,
        }
    }

    pub fn current(&self) -> MarketRegime {
        self.current
    }

    /// Multipliers for the current regime.
    pub fn multipliers(&self) -> RegimeMultipliers {
        self.multipliers_for(self.current)
    }

    pub fn multipliers_for(&self, regime: MarketRegime) -> RegimeMultipliers {
        multipliers_for(&self.cfg, regime)
    }

    /// Advance one tick; possibly transition. Returns the new regime when a
    /// transition happened.
    pub fn on_tick<R: Rng>(&mut self, rng: &mut R) -> Option<MarketRegime> {
        self.ticks_in_state += 1;

        if self.current == MarketRegime::EventShock {
            self.shock_ticks_left = self.shock_ticks_left.saturating_sub(1);
            if self.shock_ticks_left == 0 {
                return Some(self.transition_to(MarketRegime::Normal));
            }
            return None;
        }

        if self.ticks_in_state < self.cfg.min_dwell_ticks {
            return None;
        }

        let roll: f64 = rng.gen();
        let next = match self.current {
            MarketRegime::Normal => {
                if roll < self.cfg.p_normal_to_high_vol {
                    Some(MarketRegime::HighVolatility)
                } else if roll < self.cfg.p_normal_to_high_vol + self.cfg.p_normal_to_tight_liq {
                    Some(MarketRegime::TightLiquidity)
                } else {
                    None
                }
            }
            MarketRegime::HighVolatility => {
                if roll < self.cfg.p_high_vol_to_normal {
                    Some(MarketRegime::Normal)
                } else if roll < self.cfg.p_high_vol_to_normal + self.cfg.p_high_vol_to_tight_liq {
                    Some(MarketRegime::TightLiquidity)
                } else {
                    None
                }
            }
            MarketRegime::TightLiquidity => {
                if roll < self.cfg.p_tight_liq_to_normal {
                    Some(MarketRegime::Normal)
                } else if roll < self.cfg.p_tight_liq_to_normal + self.cfg.p_tight_liq_to_high_vol {
                    Some(MarketRegime::HighVolatility)
                } else {
                    None
                }
            }
            MarketRegime::EventShock => None,
        };

        next.map(|n| self.transition_to(n))
    }

    /// High-severity news forces the shock state for its configured dwell.
    pub fn force_event_shock(&mut self) {
        self.shock_ticks_left = self.cfg.event_shock_dwell_ticks;
        if self.current != MarketRegime::EventShock {
            self.transition_to(MarketRegime::EventShock);
        }
    }

    fn transition_to(&mut self, next: MarketRegime) -> MarketRegime {
        info!(from = %self.current, to = %next, dwell_ticks = self.ticks_in_state, "regime transition");
        self.current = next;
        self.ticks_in_state = 0;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn cfg() -> RegimeConfig {
        RegimeConfig::default()
    }

    #[test]
    fn respects_minimum_dwell() {
        let mut m = RegimeMachine::new(RegimeConfig {
            min_dwell_ticks: 10,
            p_normal_to_high_vol: 1.0, // would transition instantly if allowed
            ..cfg()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..9 {
            assert_eq!(m.on_tick(&mut rng), None);
        }
        assert_eq!(m.on_tick(&mut rng), Some(MarketRegime::HighVolatility));
    }

    #[test]
    fn event_shock_decays_to_normal() {
        let mut m = RegimeMachine::new(RegimeConfig {
            event_shock_dwell_ticks: 3,
            ..cfg()
        });
        m.force_event_shock();
        assert_eq!(m.current(), MarketRegime::EventShock);

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        assert_eq!(m.on_tick(&mut rng), None);
        assert_eq!(m.on_tick(&mut rng), None);
        assert_eq!(m.on_tick(&mut rng), Some(MarketRegime::Normal));
    }

    #[test]
    fn forcing_shock_resets_the_dwell() {
        let mut m = RegimeMachine::new(RegimeConfig {
            event_shock_dwell_ticks: 5,
            ..cfg()
        });
        m.force_event_shock();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        m.on_tick(&mut rng);
        m.on_tick(&mut rng);
        m.force_event_shock(); // second headline while still shocked
        for _ in 0..4 {
            assert_eq!(m.on_tick(&mut rng), None);
        }
        assert_eq!(m.on_tick(&mut rng), Some(MarketRegime::Normal));
    }

    #[test]
    fn shock_multipliers_dominate_normal() {
        let m = RegimeMachine::new(cfg());
        let normal = m.multipliers_for(MarketRegime::Normal);
        let shock = m.multipliers_for(MarketRegime::EventShock);
        assert!(shock.vol > normal.vol);
        assert!(shock.liquidity > normal.liquidity);
        assert!(shock.borrow > normal.borrow);
    }
}
